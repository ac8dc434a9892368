use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use fbtool::capture::{default_output_path, FlashCapturer};
use tempfile::TempDir;
use zip::{write::FileOptions, ZipArchive, ZipWriter};

const FLASH_ALL_SH: &str = "#!/bin/sh
set -e
# PROLOG_END
fastboot flash --slot=other bootloader bootloader-walleye.img
fastboot --set-active=other
fastboot reboot-bootloader
fastboot flash --slot=other bootloader bootloader-walleye.img
fastboot --set-active=other
fastboot reboot-bootloader
fastboot flash radio radio-walleye.img
fastboot reboot-bootloader
fastboot -w update image-walleye-opm1.zip
";

const FLASH_ALL_BAT: &str = "@ECHO OFF\r
:: PROLOG_END\r
fastboot -w update image-walleye-opm1.zip\r
";

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        zip.start_file(*name, FileOptions::<()>::default())
            .expect("start entry");
        zip.write_all(data).expect("write entry");
    }
    zip.finish().expect("finish zip").into_inner()
}

fn write_factory(path: &Path, extra: &[(&str, &[u8])]) {
    let boot = vec![0x33u8; 4096];
    let system: Vec<u8> = (0..8192).map(|i| (i % 199) as u8).collect();
    let mut images: Vec<(&str, &[u8])> = vec![
        ("android-info.txt", &b"require board=walleye\n"[..]),
        ("boot.img", &boot[..]),
        ("system.img", &system[..]),
    ];
    images.extend_from_slice(extra);
    let update = zip_bytes(&images);
    let factory = zip_bytes(&[
        ("walleye-opm1/flash-all.sh", FLASH_ALL_SH.as_bytes()),
        ("walleye-opm1/flash-all.bat", FLASH_ALL_BAT.as_bytes()),
        ("walleye-opm1/bootloader-walleye.img", b"bootloader"),
        ("walleye-opm1/radio-walleye.img", b"radio"),
        ("walleye-opm1/image-walleye-opm1.zip", &update),
    ]);
    std::fs::write(path, factory).expect("write factory zip");
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> String {
    let mut entry = archive.by_name(name).expect(name);
    let mut text = String::new();
    entry.read_to_string(&mut text).expect("read entry");
    text
}

#[test]
fn factory_archive_becomes_a_replayable_script() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp = TempDir::new().expect("temp dir");
    let factory = temp.path().join("walleye-opm1-factory.zip");
    write_factory(&factory, &[]);
    let out = default_output_path(&factory).expect("output path");
    assert_eq!(out, temp.path().join("walleye-opm1-factory-opt.zip"));

    let capturer = FlashCapturer::create(&out, 64 * 1024 * 1024, &BTreeMap::new()).expect("create");
    let mut plan = capturer.plan();
    capturer.run(&mut plan, &factory).expect("capture");

    let mut archive = ZipArchive::new(File::open(&out).expect("open output")).expect("read output");
    for name in [
        "bootloader-walleye.img",
        "radio-walleye.img",
        "android-info.txt",
        "android-info.zip",
        "boot.img",
        "system.img",
        "flash-all.sh",
        "flash-all.bat",
    ] {
        assert!(archive.by_name(name).is_ok(), "missing {name}");
    }

    let script = read_entry(&mut archive, "script.txt");
    let lines: Vec<&str> = script.lines().collect();
    let position = |needle: &str| {
        lines
            .iter()
            .position(|line| *line == needle)
            .unwrap_or_else(|| panic!("'{needle}' not in script:\n{script}"))
    };
    let set_active = position("run-cmd set_active:a");
    let check = position("check-requirements android-info.txt");
    let boot = position("flash boot boot.img");
    let system = position("flash system system.img");
    assert!(set_active < check && check < boot && boot < system);

    let sh = read_entry(&mut archive, "flash-all.sh");
    assert!(sh.starts_with("#!/bin/sh"));
    assert!(sh.contains("fastboot flash system system.img"));
}

#[test]
fn capture_needs_a_sparse_limit() {
    let temp = TempDir::new().expect("temp dir");
    let out = temp.path().join("out.zip");
    assert!(FlashCapturer::create(&out, 0, &BTreeMap::new()).is_err());
    assert!(default_output_path(Path::new("factory.tar")).is_err());
}

#[test]
fn signed_images_cannot_be_captured() {
    let temp = TempDir::new().expect("temp dir");
    let factory = temp.path().join("walleye-opm1-factory.zip");
    write_factory(&factory, &[("boot.sig", b"signature")]);
    let out = default_output_path(&factory).expect("output path");

    let capturer = FlashCapturer::create(&out, 64 * 1024 * 1024, &BTreeMap::new()).expect("create");
    let mut plan = capturer.plan();
    let err = capturer.run(&mut plan, &factory).unwrap_err();
    assert!(format!("{err:#}").contains("unexpected signature boot.img"), "{err:#}");
}
