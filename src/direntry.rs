use std::time::SystemTime;

use arbitrary_int::u2;
use bitbybit::bitfield;
use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike};
use static_assertions::const_assert;

pub const DIRENTRY_SIZE: usize = 32;

/// Byte offsets of the 13 UTF-16 code units inside a long-filename
/// directory entry.
pub const LFN_MAP: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Attribute value marking a long-filename entry.
pub const ATTR_LONG_NAME: u8 = 0x0F;

#[bitfield(u8)]
#[derive(Debug, Zeroable, Pod, PartialEq)]
pub struct Attributes {
    #[bit(0, rw)]
    read_only: bool,

    #[bit(1, rw)]
    hidden: bool,

    #[bit(2, rw)]
    system: bool,

    #[bit(3, rw)]
    volume_label: bool,

    #[bit(4, rw)]
    directory: bool,

    #[bit(5, rw)]
    archive: bool,

    #[bits(6..=7, rw)]
    reserved: u2,
}

/// A 32-byte FAT directory entry.
///
/// For long-filename entries the same 32 bytes are reinterpreted: the
/// first byte holds the sequence number (0x40 set on the physically
/// first entry), the name bytes scatter across `LFN_MAP`, and
/// `reserved[1]` holds the short-name checksum.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct DirEntry {
    pub name: [u8; 8],
    pub extension: [u8; 3],
    pub attributes: Attributes,
    pub reserved: [u8; 2],
    pub ctime: u16,
    pub cdate: u16,
    pub adate: u16,
    pub begin_hi: u16,
    pub mtime: u16,
    pub mdate: u16,
    pub begin: u16,
    pub size: u32,
}

const_assert!(std::mem::size_of::<DirEntry>() == DIRENTRY_SIZE);

impl Default for DirEntry {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

impl DirEntry {
    pub fn is_long_name(&self) -> bool {
        self.attributes.raw_value() == ATTR_LONG_NAME
    }

    pub fn start_cluster(&self) -> u32 {
        self.begin as u32 | ((self.begin_hi as u32) << 16)
    }

    pub fn set_start_cluster(&mut self, begin: u32) {
        self.begin = (begin & 0xFFFF) as u16;
        self.begin_hi = ((begin >> 16) & 0xFFFF) as u16;
    }
}

/// Short-name checksum stamped into every long-filename entry of a
/// group: rotate right, add, over all 11 name bytes.
pub fn fat_chksum(entry: &DirEntry) -> u8 {
    let mut chksum: u8 = 0;
    for i in 0..11 {
        let c = if i < 8 {
            entry.name[i]
        } else {
            entry.extension[i - 8]
        };
        chksum = (((chksum & 0xFE) >> 1) | if chksum & 0x01 != 0 { 0x80 } else { 0 })
            .wrapping_add(c);
    }
    chksum
}

/// Pack a host timestamp as FAT (date, time), in local time.
pub fn fat_datetime(time: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = time.into();
    let year = (local.year() - 1980).clamp(0, 127) as u16;
    let date = local.day() as u16 | ((local.month() as u16) << 5) | (year << 9);
    let time = (local.second() as u16 / 2)
        | ((local.minute() as u16) << 5)
        | ((local.hour() as u16) << 11);
    (date, time)
}

/// Unpack a FAT (date, time) pair back into a host timestamp,
/// interpreted in local time. Returns `None` for nonsense stamps.
pub fn decode_fat_datetime(date: u16, time: u16) -> Option<SystemTime> {
    let year = 1980 + (date >> 9) as i32;
    let month = (date >> 5) as u32 & 0x0F;
    let day = date as u32 & 0x1F;
    let hour = (time >> 11) as u32;
    let minute = (time >> 5) as u32 & 0x3F;
    let second = (time as u32 & 0x1F) << 1;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.into())
}

#[test]
fn checksum_known_value() {
    let mut entry = DirEntry::default();
    entry.name.copy_from_slice(b"HELLO   ");
    entry.extension.copy_from_slice(b"TXT");
    // reference value from the canonical rotate-add formula
    let mut expected: u8 = 0;
    for &c in b"HELLO   TXT" {
        expected = expected.rotate_right(1).wrapping_add(c);
    }
    assert_eq!(fat_chksum(&entry), expected);
}

#[test]
fn start_cluster_split() {
    let mut entry = DirEntry::default();
    entry.set_start_cluster(0x0012_3456);
    assert_eq!({ entry.begin }, 0x3456);
    assert_eq!({ entry.begin_hi }, 0x0012);
    assert_eq!(entry.start_cluster(), 0x0012_3456);
}

#[test]
fn datetime_roundtrip() {
    let (date, time) = (
        // 2011-06-18
        18 | (6 << 5) | ((2011 - 1980) << 9),
        // 20:14:42
        (42 / 2) | (14 << 5) | (20 << 11),
    );
    let decoded = decode_fat_datetime(date, time).unwrap();
    assert_eq!(fat_datetime(decoded), (date, time));
}

#[test]
fn datetime_rejects_nonsense() {
    assert!(decode_fat_datetime(0, 0).is_none()); // month 0, day 0
    assert!(decode_fat_datetime(31 | (13 << 5), 0).is_none()); // month 13
}
