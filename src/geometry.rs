use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{info, warn};

use crate::boot_region::{partition_fat_type, BootSector, Mbr, BOOT_MAGIC, SECTOR_SIZE};
use crate::fat_region::FatType;
use crate::{VfatError, VVFAT_BOOT, VVFAT_MBR};

/// Disk geometry and FAT layout parameters, either auto-selected from
/// the disk size or adopted from sidecar MBR / boot sector images.
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub spt: u32,
    pub sector_count: u32,
    pub offset_to_bootsector: u32,
    pub fat_type: FatType,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub root_entries: u16,
    pub first_cluster_of_root_dir: u32,
    pub use_boot_file: bool,
    /// Imported sidecar images, installed verbatim into the first
    /// sectors.
    pub mbr_image: Option<Box<[u8; SECTOR_SIZE]>>,
    pub boot_image: Option<Box<[u8; SECTOR_SIZE]>>,
}

impl Geometry {
    pub fn media_type(&self) -> u8 {
        match self.fat_type {
            FatType::Fat12 => 0xF0,
            _ => 0xF8,
        }
    }

    /// Disk size in bytes.
    pub fn disk_size(&self) -> u64 {
        u64::from(self.sector_count) * 512
    }
}

/// Read the first sector of a sidecar image, requiring the 0x55 0xAA
/// signature. Missing or malformed sidecars read as absent.
fn read_sector_from_file(path: &Path) -> Option<Box<[u8; SECTOR_SIZE]>> {
    let mut file = File::open(path).ok()?;
    let mut buffer = Box::new([0u8; SECTOR_SIZE]);
    file.read_exact(&mut buffer[..]).ok()?;
    (buffer[0x1FE..] == BOOT_MAGIC).then_some(buffer)
}

/// Work out the volume geometry for a shadowed directory.
///
/// Sidecar images win over everything; otherwise a 1.44 MB request
/// becomes a floppy, and anything else uses the caller's CHS (or the
/// 1024x16x63 default) with the FAT type and cluster size picked from
/// the resulting capacity.
pub fn detect(
    dir: &Path,
    hd_size: u64,
    chs: Option<(u32, u32, u32)>,
) -> Result<Geometry, VfatError> {
    let mut fat_type: Option<FatType> = None;
    let mut sectors_per_cluster: u8 = 0;
    let mut reserved_sectors: u16 = 0;
    let mut root_entries: u16 = 0;
    let mut first_cluster_of_root_dir: u32 = 0;
    let (mut cylinders, mut heads, mut spt) = chs.unwrap_or((0, 0, 0));
    let mut sector_count: u32 = 0;
    let mut offset_to_bootsector: u32 = 0;
    let mut use_mbr_file = false;
    let mut use_boot_file = false;
    let mut mbr_image = None;
    let mut boot_image = None;

    if let Some(image) = read_sector_from_file(&dir.join(VVFAT_MBR)) {
        let mbr: Mbr = bytemuck::pod_read_unaligned(&image[..]);
        let partition = mbr.partitions[0];
        if partition.fs_type != 0 && { partition.length_sectors } > 0 {
            match partition_fat_type(partition.fs_type) {
                Some(imported) => {
                    fat_type = Some(imported);
                    sector_count = { partition.start_sector } + { partition.length_sectors };
                    spt = { partition.start_sector };
                    heads = if partition.end_chs.head > 15 {
                        16
                    } else {
                        u32::from(partition.end_chs.head) + 1
                    };
                    cylinders = sector_count / (heads * spt);
                    offset_to_bootsector = spt;
                    mbr_image = Some(image);
                    use_mbr_file = true;
                    info!("using MBR from file");
                }
                None => {
                    warn!(
                        "MBR file: unsupported FS type = {:#04x}",
                        partition.fs_type
                    );
                }
            }
        }
    }

    if let Some(image) = read_sector_from_file(&dir.join(VVFAT_BOOT)) {
        let bs: BootSector = bytemuck::pod_read_unaligned(&image[..]);
        let advertised_sectors =
            u32::from({ bs.total_sectors16 }) + { bs.total_sectors } + { bs.hidden_sectors };
        if use_mbr_file {
            // adopt the boot sector only if it agrees with the MBR
            let imported = fat_type.unwrap();
            let ftype_ok = match imported {
                FatType::Fat32 => bs.fat32().fat_type == *imported.name(),
                _ => bs.fat16().fat_type == *imported.name(),
            };
            if ftype_ok && advertised_sectors == sector_count && bs.number_of_fats == 2 {
                use_boot_file = true;
            }
        } else {
            let identified = if bs.fat16().fat_type == *FatType::Fat12.name() {
                FatType::Fat12
            } else if bs.fat16().fat_type == *FatType::Fat16.name() {
                FatType::Fat16
            } else if bs.fat32().fat_type == *FatType::Fat32.name() {
                FatType::Fat32
            } else {
                return Err(VfatError::UnsupportedBootSector);
            };
            fat_type = Some(identified);
            if bs.number_of_fats == 2 {
                sector_count = advertised_sectors;
                spt = u32::from({ bs.sectors_per_track });
                heads = if { bs.number_of_heads } > 15 {
                    16
                } else {
                    u32::from({ bs.number_of_heads })
                };
                cylinders = sector_count / (heads * spt);
                offset_to_bootsector = { bs.hidden_sectors };
                use_boot_file = true;
            }
        }
        if use_boot_file {
            sectors_per_cluster = bs.sectors_per_cluster;
            reserved_sectors = { bs.reserved_sectors };
            root_entries = { bs.root_entries };
            first_cluster_of_root_dir = match fat_type {
                Some(FatType::Fat32) => bs.fat32().first_cluster_of_root_dir,
                _ => 0,
            };
            boot_image = Some(image);
            info!("using boot sector from file");
        }
    }

    if !use_mbr_file && !use_boot_file {
        if hd_size == 1_474_560 {
            // 1.44 MB floppy
            cylinders = 80;
            heads = 2;
            spt = 18;
            offset_to_bootsector = 0;
            fat_type = Some(FatType::Fat12);
            sectors_per_cluster = 1;
            first_cluster_of_root_dir = 0;
            root_entries = 224;
            reserved_sectors = 1;
        } else {
            if cylinders == 0 {
                cylinders = 1024;
                heads = 16;
                spt = 63;
            }
            offset_to_bootsector = spt;
        }
        sector_count = cylinders * heads * spt;
    }

    let disk_size = u64::from(sector_count) * 512;
    if sectors_per_cluster == 0 {
        let size_in_mb = disk_size >> 20;
        if size_in_mb >= 2047 || fat_type == Some(FatType::Fat32) {
            fat_type = Some(FatType::Fat32);
            sectors_per_cluster = if size_in_mb >= 32767 {
                64
            } else if size_in_mb >= 16383 {
                32
            } else if size_in_mb >= 8191 {
                16
            } else {
                8
            };
            first_cluster_of_root_dir = 2;
            root_entries = 0;
            reserved_sectors = 32;
        } else {
            fat_type = Some(FatType::Fat16);
            sectors_per_cluster = if size_in_mb >= 1023 {
                64
            } else if size_in_mb >= 511 {
                32
            } else if size_in_mb >= 255 {
                16
            } else if size_in_mb >= 127 {
                8
            } else {
                4
            };
            first_cluster_of_root_dir = 0;
            root_entries = 512;
            reserved_sectors = 1;
        }
    }

    Ok(Geometry {
        cylinders,
        heads,
        spt,
        sector_count,
        offset_to_bootsector,
        fat_type: fat_type.unwrap(),
        sectors_per_cluster,
        reserved_sectors,
        root_entries,
        first_cluster_of_root_dir,
        use_boot_file,
        mbr_image,
        boot_image,
    })
}

#[cfg(test)]
use bytemuck::Zeroable;

#[test]
fn floppy_geometry() {
    let dir = tempfile::TempDir::new().unwrap();
    let geometry = detect(dir.path(), 1_474_560, None).unwrap();

    assert_eq!(geometry.cylinders, 80);
    assert_eq!(geometry.heads, 2);
    assert_eq!(geometry.spt, 18);
    assert_eq!(geometry.sector_count, 2880);
    assert_eq!(geometry.offset_to_bootsector, 0);
    assert_eq!(geometry.fat_type, FatType::Fat12);
    assert_eq!(geometry.sectors_per_cluster, 1);
    assert_eq!(geometry.root_entries, 224);
    assert_eq!(geometry.reserved_sectors, 1);
    assert_eq!(geometry.media_type(), 0xF0);
}

#[test]
fn cluster_size_table() {
    let dir = tempfile::TempDir::new().unwrap();

    // 64x16x63 ~ 31 MiB: smallest FAT16 class
    let geometry = detect(dir.path(), 0, Some((64, 16, 63))).unwrap();
    assert_eq!(geometry.fat_type, FatType::Fat16);
    assert_eq!(geometry.sectors_per_cluster, 4);
    assert_eq!(geometry.root_entries, 512);
    assert_eq!(geometry.reserved_sectors, 1);
    assert_eq!(geometry.offset_to_bootsector, 63);

    // 520x16x63 ~ 255 MiB
    let geometry = detect(dir.path(), 0, Some((520, 16, 63))).unwrap();
    assert_eq!(geometry.fat_type, FatType::Fat16);
    assert_eq!(geometry.sectors_per_cluster, 16);

    // the default 1024x16x63 geometry is ~504 MiB
    let geometry = detect(dir.path(), 0, None).unwrap();
    assert_eq!(geometry.sector_count, 1024 * 16 * 63);
    assert_eq!(geometry.fat_type, FatType::Fat16);
    assert_eq!(geometry.sectors_per_cluster, 16);

    // 4200x16x63 ~ 2066 MiB: FAT32
    let geometry = detect(dir.path(), 0, Some((4200, 16, 63))).unwrap();
    assert_eq!(geometry.fat_type, FatType::Fat32);
    assert_eq!(geometry.sectors_per_cluster, 8);
    assert_eq!(geometry.root_entries, 0);
    assert_eq!(geometry.reserved_sectors, 32);
    assert_eq!(geometry.first_cluster_of_root_dir, 2);
}

#[test]
fn mbr_sidecar_wins() {
    let dir = tempfile::TempDir::new().unwrap();

    let mut mbr = Mbr::zeroed();
    mbr.magic = BOOT_MAGIC;
    mbr.partitions[0].attributes = 0x80;
    mbr.partitions[0].fs_type = 0x06;
    mbr.partitions[0].start_sector = 63;
    mbr.partitions[0].length_sectors = 64 * 16 * 63 - 63;
    mbr.partitions[0].end_chs.head = 15;
    std::fs::write(dir.path().join(VVFAT_MBR), bytemuck::bytes_of(&mbr)).unwrap();

    let geometry = detect(dir.path(), 0, None).unwrap();
    assert_eq!(geometry.fat_type, FatType::Fat16);
    assert_eq!(geometry.sector_count, 64 * 16 * 63);
    assert_eq!(geometry.spt, 63);
    assert_eq!(geometry.heads, 16);
    assert_eq!(geometry.offset_to_bootsector, 63);
    assert!(geometry.mbr_image.is_some());
    // no boot sidecar, so cluster size still comes from the table
    assert_eq!(geometry.sectors_per_cluster, 4);
}

#[test]
fn mbr_sidecar_with_unknown_type_is_ignored() {
    let dir = tempfile::TempDir::new().unwrap();

    let mut mbr = Mbr::zeroed();
    mbr.magic = BOOT_MAGIC;
    mbr.partitions[0].fs_type = 0x83;
    mbr.partitions[0].length_sectors = 1000;
    std::fs::write(dir.path().join(VVFAT_MBR), bytemuck::bytes_of(&mbr)).unwrap();

    let geometry = detect(dir.path(), 0, None).unwrap();
    assert!(geometry.mbr_image.is_none());
    assert_eq!(geometry.sector_count, 1024 * 16 * 63);
}

#[test]
fn boot_sector_sidecar_geometry() {
    let dir = tempfile::TempDir::new().unwrap();

    let mut bs = BootSector::zeroed();
    bs.jump = [0xEB, 0x3E, 0x90];
    bs.sector_size = 512;
    bs.sectors_per_cluster = 8;
    bs.reserved_sectors = 1;
    bs.number_of_fats = 2;
    bs.root_entries = 512;
    bs.media_type = 0xF8;
    bs.sectors_per_fat = 250;
    bs.sectors_per_track = 63;
    bs.number_of_heads = 16;
    bs.hidden_sectors = 63;
    bs.total_sectors = 512 * 16 * 63 - 63;
    bs.fat16_mut().fat_type = *FatType::Fat16.name();
    bs.magic = BOOT_MAGIC;
    std::fs::write(dir.path().join(VVFAT_BOOT), bytemuck::bytes_of(&bs)).unwrap();

    let geometry = detect(dir.path(), 0, None).unwrap();
    assert!(geometry.use_boot_file);
    assert_eq!(geometry.fat_type, FatType::Fat16);
    assert_eq!(geometry.sector_count, 512 * 16 * 63);
    assert_eq!(geometry.sectors_per_cluster, 8);
    assert_eq!(geometry.offset_to_bootsector, 63);
    assert_eq!(geometry.root_entries, 512);
}
