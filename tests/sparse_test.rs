use std::fs;
use std::io::Write;

use fbtool::sparse::SparseFile;
use tempfile::TempDir;

fn sample() -> SparseFile {
    let mut sparse = SparseFile::new(4096, 64 * 4096).expect("sparse file");
    sparse.add_data(vec![0x5a; 3 * 4096], 0).expect("data");
    sparse.add_fill(0xdead_beef, 8 * 4096, 10).expect("fill");
    let noise: Vec<u8> = (0..20 * 4096).map(|i| (i % 253) as u8).collect();
    sparse.add_data(noise, 30).expect("data");
    sparse
}

#[test]
fn resparsed_pieces_fit_and_reassemble() {
    let sparse = sample();
    let mut whole = Vec::new();
    sparse.apply_to(&mut whole).expect("apply whole");

    let limit = 6 * 4096;
    let pieces = sparse.resparse(limit).expect("resparse");
    assert!(pieces.len() > 1);

    let mut next = 0;
    let mut rebuilt = Vec::new();
    for piece in &pieces {
        assert!(piece.encoded_len() <= limit, "{} > {limit}", piece.encoded_len());
        assert_eq!(piece.len(), sparse.len());
        let covered = piece.covered_range();
        assert_eq!(covered.start, next);
        next = covered.end;

        let mut out = Vec::new();
        piece.write_sparse(&mut out).expect("encode piece");
        assert_eq!(out.len() as u64, piece.encoded_len());

        piece.apply_to(&mut rebuilt).expect("apply piece");
    }
    assert_eq!(next, sparse.len());
    assert_eq!(rebuilt, whole);
}

#[test]
fn resparse_rejects_impossible_limits() {
    assert!(sample().resparse(4096).is_err());
}

#[test]
fn raw_files_import_with_fill_detection() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("raw.img");
    let mut data = vec![0u8; 4 * 4096];
    data[4096..8192].fill(0x42);
    data[8192..8200].copy_from_slice(b"fbtool!!");
    let mut file = fs::File::create(&path).expect("create");
    file.write_all(&data).expect("write");
    drop(file);

    let file = fs::File::open(&path).expect("open");
    assert!(SparseFile::import(&file).expect("probe").is_none());
    let sparse = SparseFile::import_auto(&file).expect("import");
    assert_eq!(sparse.len(), data.len() as u64);
    // zero fill, 0x42 fill, raw block, zero fill
    assert_eq!(sparse.chunk_count(), 4);

    let mut image = Vec::new();
    sparse.apply_to(&mut image).expect("apply");
    assert_eq!(image, data);
}

#[test]
fn sparse_files_import_unchanged() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("sparse.img");
    let sparse = sample();
    let mut out = Vec::new();
    sparse.write_sparse(&mut out).expect("encode");
    fs::write(&path, &out).expect("write");

    let file = fs::File::open(&path).expect("open");
    let imported = SparseFile::import(&file)
        .expect("import")
        .expect("recognized as sparse");
    let (mut a, mut b) = (Vec::new(), Vec::new());
    sparse.apply_to(&mut a).expect("apply original");
    imported.apply_to(&mut b).expect("apply imported");
    assert_eq!(a, b);
}
