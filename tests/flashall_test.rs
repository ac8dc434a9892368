use std::fs;
use std::path::Path;

use fbtool::commands::{run_commands, Command, SessionOptions};
use fbtool::driver::sim::SimulatedDevice;
use fbtool::flashall::FlashAllTool;
use fbtool::images;
use fbtool::lp::{BlockDevice, Geometry, LpMetadata, Partition, PartitionGroup};
use fbtool::partition::wipe_super;
use fbtool::plan::FlashingPlan;
use fbtool::source::LocalImageSource;
use fbtool::sparse::SPARSE_HEADER_MAGIC;
use fbtool::task::Task;
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn walleye() -> SimulatedDevice {
    SimulatedDevice::with_vars([
        ("product", "walleye"),
        ("slot-count", "2"),
        ("current-slot", "a"),
        ("has-slot:*", "yes"),
        ("max-download-size", "0x4000000"),
        ("is-userspace", "no"),
    ])
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn write_build(dir: &Path) -> (Vec<u8>, Vec<u8>) {
    let boot = pattern(4096, 0x11);
    let system = pattern(8192, 0x22);
    fs::write(dir.join("android-info.txt"), "require board=walleye\n").expect("android-info");
    fs::write(dir.join("boot.img"), &boot).expect("boot.img");
    fs::write(dir.join("system.img"), &system).expect("system.img");
    (boot, system)
}

fn super_empty() -> LpMetadata {
    LpMetadata {
        geometry: Geometry {
            metadata_max_size: 65536,
            metadata_slot_count: 2,
            logical_block_size: 4096,
        },
        minor_version: 0,
        header_flags: 0,
        partitions: vec![Partition {
            name: "system_a".to_string(),
            attributes: 0,
            first_extent_index: 0,
            num_extents: 0,
            group_index: 1,
        }],
        extents: Vec::new(),
        groups: vec![
            PartitionGroup {
                name: "default".to_string(),
                flags: 0,
                maximum_size: 0,
            },
            PartitionGroup {
                name: "group_a".to_string(),
                flags: 0,
                maximum_size: 0,
            },
        ],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 1024 * 1024,
            alignment_offset: 0,
            size: 8 * 1024 * 1024,
            partition_name: "super".to_string(),
            flags: 0,
        }],
    }
}

fn render(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|t| t.to_string()).collect()
}

#[test]
fn image_list_orders_boot_images_before_super() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    write_build(temp.path());

    let mut plan = FlashingPlan::new(Box::new(SimulatedDevice::new()));
    plan.images = images::catalog()
        .into_iter()
        .filter(|image| matches!(image.nickname, "boot" | "system"))
        .collect();
    plan.skip_secondary = true;
    plan.source = Some(Box::new(LocalImageSource::new(temp.path())));

    let tasks = FlashAllTool::new(&mut plan).collect_tasks().expect("collect tasks");
    assert_eq!(render(&tasks), ["flash boot", "update-super", "flash system"]);
}

#[test]
fn flashall_writes_current_slot_and_reboots() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    let (boot, system) = write_build(temp.path());

    let device = walleye();
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.product_out = Some(temp.path().to_path_buf());

    run_commands(&mut plan, &[Command::FlashAll], &SessionOptions::default())
        .expect("flashall");

    assert_eq!(
        device.transcript(),
        ["set_active:a", "flash:boot_a", "flash:system_a", "reboot"]
    );
    assert_eq!(device.partition("boot_a"), Some(boot));
    assert_eq!(device.partition("system_a"), Some(system));
}

#[test]
fn flashall_refuses_the_wrong_board() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    write_build(temp.path());

    let device = walleye();
    device.set_var("product", "taimen");
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.product_out = Some(temp.path().to_path_buf());

    assert!(run_commands(&mut plan, &[Command::FlashAll], &SessionOptions::default()).is_err());
    assert!(device.transcript().is_empty());
}

#[test]
fn dynamic_partitions_fold_into_one_super_image() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    let (_, system) = write_build(temp.path());
    let blob = super_empty().to_image_blob().expect("super_empty blob");
    fs::write(temp.path().join("super_empty.img"), blob).expect("super_empty.img");

    let device = walleye();
    device.set_var("partition-size:super", "0x800000");
    device.set_var("super-partition-name", "super");
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.images = images::catalog()
        .into_iter()
        .filter(|image| matches!(image.nickname, "boot" | "system"))
        .collect();
    plan.skip_secondary = true;
    plan.source = Some(Box::new(LocalImageSource::new(temp.path())));

    let tasks = FlashAllTool::new(&mut plan).collect_tasks().expect("collect tasks");
    assert_eq!(render(&tasks), ["flash boot", "optimized-flash-super super"]);
    match &tasks[1] {
        Task::OptimizedFlashSuper(task) => assert_eq!(task.image_len(), 8 * 1024 * 1024),
        _ => panic!("expected the super task last"),
    }

    fbtool::task::run_tasks(&mut plan, &tasks).expect("run tasks");
    assert_eq!(device.transcript(), ["flash:boot_a", "flash:super (1/1)"]);

    let image = device.partition("super").expect("super flashed");
    assert_eq!(image.len(), 8 * 1024 * 1024);
    let offset = 1024 * 1024;
    assert_eq!(&image[offset..offset + system.len()], system.as_slice());
}

#[test]
fn disabled_optimization_keeps_the_super_update() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    write_build(temp.path());
    let blob = super_empty().to_image_blob().expect("super_empty blob");
    fs::write(temp.path().join("super_empty.img"), blob).expect("super_empty.img");

    let device = walleye();
    device.set_var("partition-size:super", "0x800000");
    let mut plan = FlashingPlan::new(Box::new(device));
    plan.images = images::catalog()
        .into_iter()
        .filter(|image| matches!(image.nickname, "boot" | "system"))
        .collect();
    plan.skip_secondary = true;
    plan.should_optimize_flash_super = false;
    plan.source = Some(Box::new(LocalImageSource::new(temp.path())));

    let tasks = FlashAllTool::new(&mut plan).collect_tasks().expect("collect tasks");
    assert_eq!(
        render(&tasks),
        ["flash boot", "update-super", "resize system 0", "flash system"]
    );
}

#[test]
fn wipes_run_before_queued_tasks() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    let (boot, _) = write_build(temp.path());

    let device = walleye();
    device.set_var("partition-type:userdata", "raw");
    device.set_var("partition-size:userdata", "0x1000");
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.wants_wipe = true;

    let commands = Command::parse(&[
        "flash".to_string(),
        "boot".to_string(),
        temp.path().join("boot.img").display().to_string(),
        "reboot".to_string(),
    ])
    .expect("parse");
    run_commands(&mut plan, &commands, &SessionOptions::default()).expect("run");

    // cache and metadata report no partition type and are skipped
    assert_eq!(device.transcript(), ["flash:boot_a", "erase:userdata", "reboot"]);
    assert_eq!(device.partition("boot_a"), Some(boot));
}

#[test]
fn set_active_runs_after_flashing_commands() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    write_build(temp.path());

    let device = walleye();
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.slot_override = "other".to_string();
    let commands = Command::parse(&[
        "flash".to_string(),
        "boot".to_string(),
        temp.path().join("boot.img").display().to_string(),
    ])
    .expect("parse");
    let options = SessionOptions {
        set_active: Some(String::new()),
    };
    run_commands(&mut plan, &commands, &options).expect("run");

    assert_eq!(device.transcript(), ["flash:boot_b", "set_active:b"]);
}

#[test]
fn device_errors_stop_the_session() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    write_build(temp.path());

    let device = walleye();
    device.fail_on("flash:system", "partition is locked");
    let mut plan = FlashingPlan::new(Box::new(device.clone()));
    plan.product_out = Some(temp.path().to_path_buf());

    let err = run_commands(&mut plan, &[Command::FlashAll], &SessionOptions::default())
        .unwrap_err();
    assert!(format!("{err:#}").contains("partition is locked"), "{err:#}");
    // nothing after the failed flash, not even the queued reboot
    assert_eq!(device.transcript(), ["set_active:a", "flash:boot_a"]);
}

#[test]
fn fetch_reads_back_in_pieces() {
    init_logger();
    let temp = TempDir::new().expect("temp dir");
    let data = pattern(10_000, 0x5c);

    let device = walleye();
    device.remove_var("has-slot:*");
    device.set_var("max-fetch-size", "4096");
    device.set_var("partition-size:logo", "10000");
    device.set_partition("logo", data.clone());
    let mut plan = FlashingPlan::new(Box::new(device.clone()));

    let out = temp.path().join("logo.img");
    let commands = Command::parse(&[
        "fetch".to_string(),
        "logo".to_string(),
        out.display().to_string(),
    ])
    .expect("parse");
    run_commands(&mut plan, &commands, &SessionOptions::default()).expect("fetch");

    assert_eq!(fs::read(&out).expect("fetched file"), data);
    assert_eq!(
        device.transcript(),
        [
            "fetch:logo:0x00000000:0x00001000",
            "fetch:logo:0x00001000:0x00001000",
            "fetch:logo:0x00002000:0x00000710",
        ]
    );
}

#[test]
fn retrofit_wipe_super_survives_a_rejected_oem_command() {
    init_logger();
    let device = walleye();
    device.remove_var("has-slot:*");
    device.fail_on("oem allow-flash-super", "unknown command");
    let mut plan = FlashingPlan::new(Box::new(device.clone()));

    let mut metadata = super_empty();
    metadata.block_devices[0].partition_name = "system".to_string();
    wipe_super(&mut plan, &metadata, "a").expect("wipe super");

    assert_eq!(device.transcript(), ["flash:system"]);
    let written = device.partition("system").expect("system written");
    assert_eq!(&written[..4], &SPARSE_HEADER_MAGIC.to_le_bytes());
}
