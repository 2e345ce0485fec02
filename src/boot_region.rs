use arbitrary_int::{u2, u6};
use bitbybit::bitfield;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use crate::fat_region::FatType;

pub const SECTOR_SIZE: usize = 512;
pub const BOOT_MAGIC: [u8; 2] = [0x55, 0xAA];

/// Windows NT disk signature written into generated MBRs.
pub const NT_DISK_SIGNATURE: u32 = 0xBE1A_FDFA;

/// CHS address as stored in an MBR partition entry. The sector byte
/// carries the two high cylinder bits in its top two bits.
#[bitfield(u8)]
#[derive(Zeroable, Pod)]
struct SectorByte {
    #[bits(0..=5, rw)]
    sector: u6,

    #[bits(6..=7, rw)]
    cylinder_hi: u2,
}

#[derive(Clone, Copy, Zeroable, Pod, Default, Debug, PartialEq)]
#[repr(C)]
pub struct Chs {
    pub head: u8,
    pub sector: u8,
    pub cylinder: u8,
}

impl Chs {
    /// Encode a linear sector position. Returns the address and
    /// whether it overflowed 24-bit CHS (the caller then relies on
    /// LBA; the stored address saturates to FF/FF/FF, which is what
    /// DOS and Windows expect for nonrepresentable positions).
    pub fn from_sector(sector_pos: u32, heads: u32, spt: u32) -> (Self, bool) {
        let sector = sector_pos % spt;
        let rest = sector_pos / spt;
        let head = rest % heads;
        let cylinder = rest / heads;

        if cylinder > 1023 {
            return (
                Self {
                    head: 0xFF,
                    sector: 0xFF,
                    cylinder: 0xFF,
                },
                true,
            );
        }

        let sector_byte = SectorByte::new_with_raw_value(0)
            .with_sector(u6::new((sector + 1) as u8))
            .with_cylinder_hi(u2::new((cylinder >> 8) as u8));
        (
            Self {
                head: head as u8,
                sector: sector_byte.raw_value(),
                cylinder: cylinder as u8,
            },
            false,
        )
    }
}

#[derive(Clone, Copy, Zeroable, Pod, Default)]
#[repr(C, packed)]
pub struct PartitionEntry {
    /// 0x80 marks the partition bootable.
    pub attributes: u8,
    pub start_chs: Chs,
    pub fs_type: u8,
    pub end_chs: Chs,
    pub start_sector: u32,
    pub length_sectors: u32,
}

const_assert!(std::mem::size_of::<PartitionEntry>() == 16);

/// FAT type advertised by an MBR partition entry, if it is one this
/// system supports importing.
pub fn partition_fat_type(fs_type: u8) -> Option<FatType> {
    match fs_type {
        0x06 | 0x0E => Some(FatType::Fat16),
        0x0B | 0x0C => Some(FatType::Fat32),
        _ => None,
    }
}

/// Partition type byte for a generated MBR. DOS uses distinct types
/// for LBA partitions so older versions do not try CHS on them.
pub fn partition_type(fat_type: FatType, lba: bool) -> u8 {
    match fat_type {
        FatType::Fat12 => 0x01,
        FatType::Fat16 => {
            if lba {
                0x0E
            } else {
                0x06
            }
        }
        FatType::Fat32 => {
            if lba {
                0x0C
            } else {
                0x0B
            }
        }
    }
}

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct Mbr {
    pub ignored: [u8; 0x1B8],
    pub nt_id: u32,
    pub ignored2: [u8; 2],
    pub partitions: [PartitionEntry; 4],
    pub magic: [u8; 2],
}

const_assert!(std::mem::size_of::<Mbr>() == SECTOR_SIZE);

/// Boot sector: BIOS Parameter Block common to all FAT widths, with
/// the width-specific extension accessed through `fat16`/`fat32`.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub name: [u8; 8],
    pub sector_size: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub number_of_fats: u8,
    pub root_entries: u16,
    pub total_sectors16: u16,
    pub media_type: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors: u32,
    ext: [u8; 474],
    pub magic: [u8; 2],
}

const_assert!(std::mem::size_of::<BootSector>() == SECTOR_SIZE);

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct Fat16Ext {
    pub drive_number: u8,
    pub reserved: u8,
    pub signature: u8,
    pub id: u32,
    pub volume_label: [u8; 11],
    pub fat_type: [u8; 8],
}

const_assert!(std::mem::size_of::<Fat16Ext>() == 26);

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct Fat32Ext {
    pub sectors_per_fat: u32,
    pub flags: u16,
    pub major: u8,
    pub minor: u8,
    pub first_cluster_of_root_dir: u32,
    pub info_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved1: [u8; 12],
    pub drive_number: u8,
    pub reserved2: u8,
    pub signature: u8,
    pub id: u32,
    pub volume_label: [u8; 11],
    pub fat_type: [u8; 8],
}

const_assert!(std::mem::size_of::<Fat32Ext>() == 54);

impl BootSector {
    pub fn fat16(&self) -> &Fat16Ext {
        bytemuck::from_bytes(&self.ext[..std::mem::size_of::<Fat16Ext>()])
    }

    pub fn fat16_mut(&mut self) -> &mut Fat16Ext {
        bytemuck::from_bytes_mut(&mut self.ext[..std::mem::size_of::<Fat16Ext>()])
    }

    pub fn fat32(&self) -> &Fat32Ext {
        bytemuck::from_bytes(&self.ext[..std::mem::size_of::<Fat32Ext>()])
    }

    pub fn fat32_mut(&mut self) -> &mut Fat32Ext {
        bytemuck::from_bytes_mut(&mut self.ext[..std::mem::size_of::<Fat32Ext>()])
    }
}

/// FAT32 FS information sector.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct InfoSector {
    pub signature1: u32,
    pub ignored: [u8; 0x1E0],
    pub signature2: u32,
    pub free_clusters: u32,
    /// Most recently allocated cluster.
    pub mra_cluster: u32,
    pub reserved: [u8; 14],
    pub magic: [u8; 2],
}

const_assert!(std::mem::size_of::<InfoSector>() == SECTOR_SIZE);

pub const INFOSECTOR_SIGNATURE1: u32 = 0x4161_5252;
pub const INFOSECTOR_SIGNATURE2: u32 = 0x6141_7272;

#[test]
fn chs_encoding() {
    // sector 63 on a 16-head, 63-sectors-per-track disk: C/H/S 0/1/1
    let (chs, lba) = Chs::from_sector(63, 16, 63);
    assert!(!lba);
    assert_eq!(
        chs,
        Chs {
            head: 1,
            sector: 1,
            cylinder: 0
        }
    );

    // cylinder 0x234 puts its two high bits into the sector byte
    let (chs, lba) = Chs::from_sector(0x234 * 16 * 63, 16, 63);
    assert!(!lba);
    assert_eq!(chs.head, 0);
    assert_eq!(chs.sector, 1u8 | (((0x234u32 >> 8) << 6) as u8));
    assert_eq!(chs.cylinder, 0x34);

    // beyond cylinder 1023: saturate and report LBA
    let (chs, lba) = Chs::from_sector(1024 * 16 * 63, 16, 63);
    assert!(lba);
    assert_eq!(
        chs,
        Chs {
            head: 0xFF,
            sector: 0xFF,
            cylinder: 0xFF
        }
    );
}

#[test]
fn partition_types() {
    assert_eq!(partition_fat_type(0x06), Some(FatType::Fat16));
    assert_eq!(partition_fat_type(0x0E), Some(FatType::Fat16));
    assert_eq!(partition_fat_type(0x0B), Some(FatType::Fat32));
    assert_eq!(partition_fat_type(0x0C), Some(FatType::Fat32));
    assert_eq!(partition_fat_type(0x83), None);

    assert_eq!(partition_type(FatType::Fat12, false), 0x01);
    assert_eq!(partition_type(FatType::Fat16, true), 0x0E);
    assert_eq!(partition_type(FatType::Fat32, false), 0x0B);
}
