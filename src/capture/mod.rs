//! Turning a factory image archive into an optimized one.
//!
//! The factory archive's `flash-all.sh` and the update archive inside it are
//! replayed against [`CaptureDriver`], which records what a real flash-all
//! would send. The output archive holds every file that would be flashed
//! plus `script.txt`, `flash-all.sh` and `flash-all.bat` to replay them.

mod driver;
mod script;

pub use driver::{default_vars, CaptureDriver};
pub use script::ScriptWriter;

use anyhow::{bail, Context, Result};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    rc::Rc,
};
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::flashall::FlashAllTool;
use crate::lp::LpMetadata;
use crate::plan::FlashingPlan;
use crate::source::{ImageSource, ZipImageSource};
use crate::sparse::SparseFile;
use crate::utils::size_to_string;

fn entry_options() -> FileOptions<'static, ()> {
    FileOptions::<()>::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
}

/// Collects scripts and files for the output archive.
pub struct CaptureRecorder {
    pub scripts: ScriptWriter,
    writer: Option<ZipWriter<File>>,
}

impl CaptureRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("unable to create out file {}", path.display()))?;
        Ok(Self {
            scripts: ScriptWriter::new(),
            writer: Some(ZipWriter::new(file)),
        })
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>> {
        self.writer.as_mut().context("capture archive already finished")
    }

    fn start_entry(&mut self, name: &str) -> Result<&mut ZipWriter<File>> {
        let writer = self.writer()?;
        writer
            .start_file(name, entry_options())
            .with_context(|| format!("Failed to add {name} to archive"))?;
        Ok(writer)
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.start_entry(name)?
            .write_all(data)
            .with_context(|| format!("Failed to write {name} to archive"))?;
        info!("added {name}, {}", size_to_string(data.len() as u64));
        Ok(())
    }

    pub fn add_file_from_reader(&mut self, name: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let writer = self.start_entry(name)?;
        let copied = io::copy(&mut reader.take(size), writer)
            .with_context(|| format!("Failed to write {name} to archive"))?;
        if copied != size {
            bail!("short read while adding {name}: {copied} of {size} bytes");
        }
        info!("added {name}, {}", size_to_string(size));
        Ok(())
    }

    pub fn add_sparse_file(&mut self, name: &str, sparse: &SparseFile) -> Result<()> {
        let writer = self.start_entry(name)?;
        sparse
            .write_sparse(writer)
            .with_context(|| format!("Failed to write sparse {name} to archive"))?;
        info!("added sparse {name}, {}", size_to_string(sparse.encoded_len()));
        Ok(())
    }

    /// Records `android-info.txt` and a minimal update archive carrying it,
    /// since `fastboot update` is the only way to check requirements from
    /// a script.
    pub fn add_requirements_check(&mut self, android_info: &[u8]) -> Result<()> {
        self.add_file("android-info.txt", android_info)?;
        self.scripts.add_command("check-requirements android-info.txt");

        let mut zip = ZipWriter::new(io::Cursor::new(Vec::new()));
        zip.start_file("fastboot-info.txt", entry_options())?;
        zip.write_all(b"version 1\n")?;
        zip.start_file("android-info.txt", entry_options())?;
        zip.write_all(android_info)?;
        let bytes = zip
            .finish()
            .context("Failed to finalize android-info.zip")?
            .into_inner();

        let name = "android-info.zip";
        self.add_file(name, &bytes)?;
        self.scripts.add_sh_bat_comment(
            "this command only checks android-info.txt requirements, it does not perform an update",
        );
        self.scripts.add_sh_bat_command(&format!(
            "fastboot --disable-super-optimization --skip-reboot update {name}"
        ));
        Ok(())
    }

    /// Writes the three scripts and closes the archive.
    pub fn finish(&mut self) -> Result<()> {
        self.scripts.finish_bat();
        let script = self.scripts.script().to_string();
        let sh = self.scripts.sh().to_string();
        let bat = self.scripts.bat().to_string();

        self.add_file("script.txt", script.as_bytes())?;
        info!("script.txt:\n-------------------------\n{script}-------------------------");
        self.add_file("flash-all.sh", sh.as_bytes())?;
        debug!("flash-all.sh:\n-------------------------\n{sh}-------------------------");
        self.add_file("flash-all.bat", bat.as_bytes())?;
        debug!("flash-all.bat:\n-------------------------\n{bat}-------------------------");

        let writer = self.writer.take().context("capture archive already finished")?;
        writer
            .finish()
            .context("Failed to finalize archive")?
            .sync_all()
            .ok();
        Ok(())
    }
}

/// Output name used when none is given: `<factory>-opt.zip`.
pub fn default_output_path(factory: &Path) -> Result<PathBuf> {
    let name = factory.to_string_lossy();
    let Some(stem) = name.strip_suffix(".zip") else {
        bail!("factory path doesn't end with .zip: {name}");
    };
    Ok(PathBuf::from(format!("{stem}-opt.zip")))
}

/// Translates the `fastboot` lines of a factory `flash-all.sh` that run
/// before `fastboot update`.
pub fn translate_flash_all_sh(w: &mut ScriptWriter, sparse_limit: u64, contents: &str) -> Result<()> {
    let mut bootloader_flashes = 0;
    let mut added_set_active_a = false;

    for line in contents.lines() {
        if !line.starts_with("fastboot ") {
            continue;
        }
        if line.contains(" update image-") {
            break;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            bail!("invalid flash-all line {line}");
        }

        let expected_tokens = match tokens[1] {
            "flash" => {
                let other_slot = tokens.get(2) == Some(&"--slot=other");
                let first = if other_slot { 3 } else { 2 };
                let (Some(partition), Some(file)) = (tokens.get(first), tokens.get(first + 1)) else {
                    bail!("invalid flash-all line {line}");
                };
                if *partition == "bootloader" {
                    if !other_slot {
                        bail!("unexpected bootloader flash command");
                    }
                    bootloader_flashes += 1;
                }
                let suffix = if other_slot { " other-slot" } else { "" };
                w.add_command(&format!("flash {partition} {file}{suffix}"));
                w.add_sh_bat_command(line);
                first + 2
            }
            "--set-active=other" => {
                w.add_command("toggle-active-slot");
                w.add_sh_bat_command(line);
                2
            }
            "reboot-bootloader" => {
                w.add_command(tokens[1]);
                w.add_sh_bat_command(line);
                w.add_sh_line("sleep 5");
                w.add_bat_line("ping -n 5 127.0.0.1 >nul");
                if bootloader_flashes == 2 && !added_set_active_a {
                    w.add_comment("size of partition splits depends on this value");
                    w.add_check_var("max-download-size", &format!("{sparse_limit:#x}"));
                    w.add_comment(
                        "layout of the super partition depends on the current slot, which is hardcoded to slot A",
                    );
                    w.add_command("run-cmd set_active:a");
                    w.add_sh_bat_command("fastboot --set-active=a");
                    added_set_active_a = true;
                    w.add_check_var("current-slot", "a");
                }
                2
            }
            "erase" => {
                let Some(partition) = tokens.get(2) else {
                    bail!("invalid flash-all line {line}");
                };
                w.add_command(&format!("erase {partition}"));
                w.add_sh_bat_command(&format!("fastboot erase {partition}"));
                3
            }
            "snapshot-update" => {
                if tokens.get(2) != Some(&"cancel") {
                    bail!("unexpected flash-all command: {line}");
                }
                w.add_command("maybe-cancel-snapshot-update");
                w.add_sh_bat_command(line);
                3
            }
            "oem" => {
                w.add_command(&format!("run-cmd {}", tokens[1..].join(" ")));
                w.add_sh_bat_command(line);
                tokens.len()
            }
            _ => bail!("unknown flash-all command {line}"),
        };
        if tokens.len() != expected_tokens {
            bail!("unexpected number of tokens: {line}");
        }
    }

    if bootloader_flashes != 2 {
        bail!("unexpected number of flash bootloader commands: {bootloader_flashes}");
    }
    Ok(())
}

/// The parts of a factory archive a capture works from.
struct FactoryContents {
    product: String,
    update_zip: File,
    flash_all_sh: String,
    flash_all_bat: String,
}

fn read_entry_to_string(entry: &mut impl Read, name: &str) -> Result<String> {
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .with_context(|| format!("unable to extract {name}"))?;
    Ok(text)
}

/// Walks the factory archive, copying plain files straight into the output
/// and keeping the scripts and the update archive for later.
fn scan_factory(path: &Path, recorder: &mut CaptureRecorder) -> Result<FactoryContents> {
    let file = File::open(path)
        .with_context(|| format!("unable to open factory zip {}", path.display()))?;
    let mut archive = ZipArchive::new(file).context("unable to open factory zip")?;

    let mut product = String::new();
    let mut update_zip = None;
    let mut flash_all_sh = String::new();
    let mut flash_all_bat = String::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .context("factory zip iteration failed")?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let base = name.rsplit('/').next().unwrap_or(&name).to_string();
        if base.is_empty() {
            continue;
        }

        if base.starts_with("image-") && base.ends_with(".zip") {
            let rest = &base["image-".len()..];
            let Some(end) = rest.find('-') else {
                bail!("product name not found in {base}");
            };
            if update_zip.is_some() {
                bail!("more than one update zip");
            }
            product = rest[..end].to_string();
            let mut tmp = tempfile::tempfile().context("Failed to create temp file")?;
            io::copy(&mut entry, &mut tmp).with_context(|| format!("unable to extract {name}"))?;
            tmp.seek(SeekFrom::Start(0))?;
            update_zip = Some(tmp);
            continue;
        }

        if name.ends_with(".sh") {
            match base.as_str() {
                "flash-all.sh" => flash_all_sh = read_entry_to_string(&mut entry, &name)?,
                "flash-base.sh" => {}
                _ => bail!("unknown sh script: {name}"),
            }
        } else if name.ends_with(".bat") {
            if base != "flash-all.bat" {
                bail!("unknown bat script: {name}");
            }
            flash_all_bat = read_entry_to_string(&mut entry, &name)?;
        } else {
            let size = entry.size();
            recorder.add_file_from_reader(&base, &mut entry, size)?;
        }
    }

    let Some(update_zip) = update_zip else {
        bail!("no update zip");
    };
    if flash_all_sh.is_empty() {
        bail!("no flash-all.sh");
    }
    if flash_all_bat.is_empty() {
        bail!("no flash-all.bat");
    }
    if product.is_empty() {
        bail!("product name not set");
    }
    Ok(FactoryContents {
        product,
        update_zip,
        flash_all_sh,
        flash_all_bat,
    })
}

/// Drives a whole capture.
pub struct FlashCapturer {
    recorder: Rc<RefCell<CaptureRecorder>>,
    driver: CaptureDriver,
    sparse_limit: u64,
}

impl FlashCapturer {
    /// Opens the output archive. `vars` override the assumed device
    /// variables from [`default_vars`].
    pub fn create(out: &Path, sparse_limit: u64, vars: &BTreeMap<String, String>) -> Result<Self> {
        if sparse_limit == 0 {
            bail!(
                "sparse limit is not set, use the -S option to set it. Its value should be the same as the value of max-download-size fastboot variable."
            );
        }
        let recorder = Rc::new(RefCell::new(CaptureRecorder::create(out)?));
        let mut table = default_vars(sparse_limit);
        table.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        let driver = CaptureDriver::new(recorder.clone(), table);
        Ok(Self {
            recorder,
            driver,
            sparse_limit,
        })
    }

    /// A plan wired to the capture driver, ready for the caller's flags.
    pub fn plan(&self) -> FlashingPlan {
        let mut plan = FlashingPlan::new(Box::new(self.driver.clone()));
        plan.sparse_limit = self.sparse_limit;
        plan.capture = Some(self.recorder.clone());
        plan
    }

    pub fn run(&self, plan: &mut FlashingPlan, factory: &Path) -> Result<()> {
        // wipe tasks have to be recorded too
        plan.wants_wipe = true;
        plan.skip_secondary = true;

        let factory_contents = scan_factory(factory, &mut self.recorder.borrow_mut())?;
        {
            let mut recorder = self.recorder.borrow_mut();
            let w = &mut recorder.scripts;
            let Some(sh_prolog) = factory_contents.flash_all_sh.find("\n# PROLOG_END") else {
                bail!("no flash_all_sh_prolog_end");
            };
            w.add_sh_line(&factory_contents.flash_all_sh[..sh_prolog]);
            let Some(bat_prolog) = factory_contents.flash_all_bat.find("\n:: PROLOG_END") else {
                bail!("no flash_all_bat_prolog_end");
            };
            w.add_bat_line(&factory_contents.flash_all_bat[..bat_prolog]);

            w.add_sh_bat_line("echo Available devices:");
            w.add_sh_bat_command("fastboot devices -l");
            w.add_check_var("product", &factory_contents.product);
            w.add_check_var("slot-count", "2");
            translate_flash_all_sh(w, self.sparse_limit, &factory_contents.flash_all_sh)?;
            debug!("flash-all.sh converted to:\n{}", w.script());
        }

        let source = ZipImageSource::from_file(factory_contents.update_zip)?;
        if let Some(blob) = source.read_file("super_empty.img")? {
            let metadata = LpMetadata::from_image_blob(&blob).context("failed to parse super_empty.img")?;
            let device = metadata.super_device()?;
            self.driver
                .set_var(format!("partition-size:{}", device.partition_name), format!("{:#x}", device.size));
        }
        self.driver.set_var("product", factory_contents.product.clone());
        plan.source = Some(Box::new(source));

        FlashAllTool::new(plan).flash()?;
        plan.source = None;

        self.recorder.borrow_mut().finish()
    }
}
