use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Must be flashed before the super partition is touched.
    BootCritical,
    /// Flashed after the super partition has been updated.
    Normal,
    /// Only flashed when named explicitly.
    Extra,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub nickname: &'static str,
    pub img_name: &'static str,
    pub sig_name: &'static str,
    pub part_name: &'static str,
    pub optional_if_no_image: bool,
    pub image_type: ImageType,
}

impl Image {
    /// Secondary images (`*_other.img`) have no nickname and are only
    /// reached through slot-qualified enumeration.
    pub fn is_secondary(&self) -> bool {
        self.nickname.is_empty()
    }
}

/// An image paired with the slot it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub image: Image,
    pub slot: String,
}

const fn image(
    nickname: &'static str,
    img_name: &'static str,
    sig_name: &'static str,
    part_name: &'static str,
    optional_if_no_image: bool,
    image_type: ImageType,
) -> Image {
    Image {
        nickname,
        img_name,
        sig_name,
        part_name,
        optional_if_no_image,
        image_type,
    }
}

use ImageType::{BootCritical, Extra, Normal};

static IMAGES: [Image; 27] = [
    image("boot", "boot.img", "boot.sig", "boot", false, BootCritical),
    image("bootloader", "bootloader.img", "", "bootloader", true, Extra),
    image("init_boot", "init_boot.img", "init_boot.sig", "init_boot", true, BootCritical),
    image("", "boot_other.img", "boot.sig", "boot", true, Normal),
    image("cache", "cache.img", "cache.sig", "cache", true, Extra),
    image("dtbo", "dtbo.img", "dtbo.sig", "dtbo", true, BootCritical),
    image("dts", "dt.img", "dt.sig", "dts", true, BootCritical),
    image("odm", "odm.img", "odm.sig", "odm", true, Normal),
    image("odm_dlkm", "odm_dlkm.img", "odm_dlkm.sig", "odm_dlkm", true, Normal),
    image("product", "product.img", "product.sig", "product", true, Normal),
    image("pvmfw", "pvmfw.img", "pvmfw.sig", "pvmfw", true, BootCritical),
    image("radio", "radio.img", "", "radio", true, Extra),
    image("recovery", "recovery.img", "recovery.sig", "recovery", true, BootCritical),
    image("super", "super.img", "super.sig", "super", true, Extra),
    image("system", "system.img", "system.sig", "system", false, Normal),
    image("system_dlkm", "system_dlkm.img", "system_dlkm.sig", "system_dlkm", true, Normal),
    image("system_ext", "system_ext.img", "system_ext.sig", "system_ext", true, Normal),
    image("", "system_other.img", "system.sig", "system", true, Normal),
    image("userdata", "userdata.img", "userdata.sig", "userdata", true, Extra),
    image("vbmeta", "vbmeta.img", "vbmeta.sig", "vbmeta", true, BootCritical),
    image("vbmeta_system", "vbmeta_system.img", "vbmeta_system.sig", "vbmeta_system", true, BootCritical),
    image("vbmeta_vendor", "vbmeta_vendor.img", "vbmeta_vendor.sig", "vbmeta_vendor", true, BootCritical),
    image("vendor", "vendor.img", "vendor.sig", "vendor", true, Normal),
    image("vendor_boot", "vendor_boot.img", "vendor_boot.sig", "vendor_boot", true, BootCritical),
    image("vendor_dlkm", "vendor_dlkm.img", "vendor_dlkm.sig", "vendor_dlkm", true, Normal),
    image("vendor_kernel_boot", "vendor_kernel_boot.img", "vendor_kernel_boot.sig", "vendor_kernel_boot", true, BootCritical),
    image("", "vendor_other.img", "vendor.sig", "vendor", true, Normal),
];

/// The built-in image inventory in flashing order.
pub fn catalog() -> Vec<Image> {
    IMAGES.to_vec()
}

/// Resolves `name` against the product output directory.
pub fn find_item_given_name(name: &str, product_out: Option<&Path>) -> Result<PathBuf> {
    match product_out {
        Some(dir) => Ok(dir.join(name)),
        None => bail!("ANDROID_PRODUCT_OUT not set"),
    }
}

/// Resolves a catalog nickname to the path of its image file.
pub fn find_item(nickname: &str, product_out: Option<&Path>) -> Result<PathBuf> {
    let Some(image) = IMAGES
        .iter()
        .find(|image| !image.is_secondary() && image.nickname == nickname)
    else {
        bail!("unknown partition '{nickname}'");
    };
    find_item_given_name(image.img_name, product_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nicknames_resolve_under_product_out() {
        let out = Path::new("/out/target/product/x");
        assert_eq!(find_item("boot", Some(out)).unwrap(), out.join("boot.img"));
        assert_eq!(find_item("dts", Some(out)).unwrap(), out.join("dt.img"));
        assert!(find_item("bogus", Some(out)).is_err());
        assert!(find_item("", Some(out)).is_err());
        assert!(find_item("boot", None).is_err());
    }

    #[test]
    fn secondary_images_have_no_nickname() {
        let secondary: Vec<_> = IMAGES
            .iter()
            .filter(|i| i.is_secondary())
            .map(|i| i.img_name)
            .collect();
        assert_eq!(secondary, ["boot_other.img", "system_other.img", "vendor_other.img"]);
    }
}
