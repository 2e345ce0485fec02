use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use log::debug;
use static_assertions::const_assert;
use thiserror::Error;

use crate::direntry::fat_datetime;

pub const STANDARD_HEADER_MAGIC: &[u8] = b"Bochs Virtual HD Image";
pub const REDOLOG_TYPE: &[u8] = b"Redolog";

pub const SUBTYPE_UNDOABLE: &str = "Undoable";
pub const SUBTYPE_VOLATILE: &str = "Volatile";
pub const SUBTYPE_GROWING: &str = "Growing";

pub const STANDARD_HEADER_V1: u32 = 0x0001_0000;
pub const STANDARD_HEADER_VERSION: u32 = 0x0002_0000;
pub const STANDARD_HEADER_SIZE: u32 = 512;

const SECTOR: u64 = 512;
const PAGE_NOT_ALLOCATED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum RedologError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad header magic")]
    NoSignature,

    #[error("bad header type or subtype")]
    TypeMismatch,

    #[error("unsupported header version {0:#010x}")]
    VersionMismatch(u32),

    #[error("offset {0:#x} is not a multiple of the sector size")]
    Unaligned(u64),

    #[error("length {0} is not one sector")]
    BadLength(usize),

    #[error("position is beyond the end of the virtual disk")]
    OutOfBounds,

    #[error("seek mode not supported")]
    UnsupportedSeek,

    #[error("can't allocate new extent: catalog is full")]
    CatalogFull,
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct StandardHeader {
    magic: [u8; 32],
    kind: [u8; 16],
    subtype: [u8; 16],
    version: u32,
    header_size: u32,
}

const_assert!(std::mem::size_of::<StandardHeader>() == 72);

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
struct SpecificHeader {
    /// Number of catalog entries.
    catalog: u32,
    /// Bitmap size in bytes.
    bitmap: u32,
    /// Extent size in bytes, always `8 * bitmap * 512`.
    extent: u32,
    /// Modification time in FAT format (Growing subtype only).
    timestamp: u32,
    /// Virtual disk size in bytes.
    disk: u64,
}

const_assert!(std::mem::size_of::<SpecificHeader>() == 24);

/// The V1 layout has no timestamp, which moves the disk size field.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
struct SpecificHeaderV1 {
    catalog: u32,
    bitmap: u32,
    extent: u32,
    disk: u64,
}

const_assert!(std::mem::size_of::<SpecificHeaderV1>() == 20);

fn cstr_eq(field: &[u8], expected: &[u8]) -> bool {
    field.len() > expected.len()
        && &field[..expected.len()] == expected
        && field[expected.len()] == 0
}

/// Sparse copy-on-write sector store over a backing file.
///
/// Models a virtual disk of fixed size. A fixed catalog maps extent
/// indices to on-disk slots allocated on first write; a per-extent
/// bitmap tracks which sectors of an extent are present, so reads of
/// never-written sectors report absence (length 0) instead of zeroes.
#[derive(Debug)]
pub struct Redolog {
    file: File,
    standard: StandardHeader,
    specific: SpecificHeader,
    catalog: Vec<u32>,
    bitmap: Vec<u8>,
    /// The cached bitmap does not belong to the current extent.
    bitmap_stale: bool,
    extent_index: u32,
    /// Sector offset within the current extent.
    extent_offset: u32,
    /// Slot the next allocation takes.
    extent_next: u32,
    bitmap_blocks: u32,
    extent_blocks: u32,
    imagepos: u64,
}

impl Redolog {
    pub fn create<P: AsRef<Path>>(path: P, subtype: &str, size: u64) -> Result<Self, RedologError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::create_from(file, subtype, size)
    }

    /// Create a log in an already-open (e.g. freshly mkstemp'd) file.
    pub fn create_from(mut file: File, subtype: &str, size: u64) -> Result<Self, RedologError> {
        let mut standard = StandardHeader::zeroed();
        standard.magic[..STANDARD_HEADER_MAGIC.len()].copy_from_slice(STANDARD_HEADER_MAGIC);
        standard.kind[..REDOLOG_TYPE.len()].copy_from_slice(REDOLOG_TYPE);
        standard.subtype[..subtype.len()].copy_from_slice(subtype.as_bytes());
        standard.version = STANDARD_HEADER_VERSION;
        standard.header_size = STANDARD_HEADER_SIZE;

        // Double the catalog and the bitmap alternately until the
        // addressable size covers the disk.
        let (catalog_entries, bitmap_size, extent_size) = {
            let mut entries: u32 = 512;
            let mut bitmap: u32 = 1;
            let mut flip = 0u32;
            loop {
                let extent = 8 * bitmap * 512;
                if u64::from(entries) * u64::from(extent) >= size {
                    break (entries, bitmap, extent);
                }
                flip += 1;
                if flip & 1 == 1 {
                    bitmap *= 2;
                } else {
                    entries *= 2;
                }
            }
        };

        let specific = SpecificHeader {
            catalog: catalog_entries,
            bitmap: bitmap_size,
            extent: extent_size,
            timestamp: 0,
            disk: size,
        };

        debug!(
            "redolog: {} catalog entries, {} byte bitmap, {} byte extents, {} byte disk",
            catalog_entries, bitmap_size, extent_size, size
        );

        let catalog = vec![PAGE_NOT_ALLOCATED; catalog_entries as usize];

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes(&standard, &specific))?;
        file.write_all(bytemuck::cast_slice(&catalog))?;

        Ok(Self {
            file,
            standard,
            specific,
            catalog,
            bitmap: vec![0; bitmap_size as usize],
            bitmap_stale: true,
            extent_index: 0,
            extent_offset: 0,
            extent_next: 0,
            bitmap_blocks: bitmap_size.div_ceil(512),
            extent_blocks: extent_size.div_ceil(512),
            imagepos: 0,
        })
    }

    /// Open an existing log. A V1 header is migrated in memory,
    /// preserving the disk size. Opening a Growing log stamps the
    /// header timestamp from the file's mtime.
    pub fn open<P: AsRef<Path>>(path: P, subtype: &str) -> Result<Self, RedologError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mtime = file.metadata()?.modified()?;

        let (standard, specific) = Self::check_format(&mut file, subtype)?;

        let mut catalog = vec![0u32; { specific.catalog } as usize];
        file.seek(SeekFrom::Start(u64::from(standard.header_size)))?;
        file.read_exact(bytemuck::cast_slice_mut(&mut catalog))?;

        let extent_next = catalog
            .iter()
            .filter(|&&slot| slot != PAGE_NOT_ALLOCATED)
            .map(|&slot| slot + 1)
            .max()
            .unwrap_or(0);
        debug!("redolog: next extent will be at slot {extent_next}");

        let bitmap_size = { specific.bitmap };
        let extent_size = { specific.extent };
        let mut log = Self {
            file,
            standard,
            specific,
            catalog,
            bitmap: vec![0; bitmap_size as usize],
            bitmap_stale: true,
            extent_index: 0,
            extent_offset: 0,
            extent_next,
            bitmap_blocks: bitmap_size.div_ceil(512),
            extent_blocks: extent_size.div_ceil(512),
            imagepos: 0,
        };

        if subtype == SUBTYPE_GROWING {
            let (date, time) = fat_datetime(mtime);
            log.set_timestamp(u32::from(time) | (u32::from(date) << 16))?;
        }

        Ok(log)
    }

    /// Validate magic, type, subtype and version, returning the
    /// (possibly migrated) headers.
    fn check_format(
        file: &mut File,
        subtype: &str,
    ) -> Result<(StandardHeader, SpecificHeader), RedologError> {
        let mut buffer = [0u8; STANDARD_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;

        let standard: StandardHeader = bytemuck::pod_read_unaligned(&buffer[..72]);
        if !cstr_eq(&standard.magic, STANDARD_HEADER_MAGIC) {
            return Err(RedologError::NoSignature);
        }
        if !cstr_eq(&standard.kind, REDOLOG_TYPE) {
            return Err(RedologError::TypeMismatch);
        }
        if !cstr_eq(&standard.subtype, subtype.as_bytes()) {
            return Err(RedologError::TypeMismatch);
        }

        let specific = match standard.version {
            STANDARD_HEADER_VERSION => bytemuck::pod_read_unaligned(&buffer[72..96]),
            STANDARD_HEADER_V1 => {
                let v1: SpecificHeaderV1 = bytemuck::pod_read_unaligned(&buffer[72..92]);
                SpecificHeader {
                    catalog: v1.catalog,
                    bitmap: v1.bitmap,
                    extent: v1.extent,
                    timestamp: 0,
                    disk: v1.disk,
                }
            }
            version => return Err(RedologError::VersionMismatch(version)),
        };

        Ok((standard, specific))
    }

    /// Virtual disk size in bytes.
    pub fn size(&self) -> u64 {
        self.specific.disk
    }

    pub fn timestamp(&self) -> u32 {
        self.specific.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) -> Result<(), RedologError> {
        self.specific.timestamp = timestamp;
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&header_bytes(&self.standard, &self.specific))?;
        Ok(())
    }

    /// Sector-granular seek. Only `Start` and `Current` are supported.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, RedologError> {
        let newpos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let pos = self.imagepos as i64 + delta;
                if pos < 0 {
                    return Err(RedologError::OutOfBounds);
                }
                pos as u64
            }
            SeekFrom::End(_) => return Err(RedologError::UnsupportedSeek),
        };
        if newpos % SECTOR != 0 {
            return Err(RedologError::Unaligned(newpos));
        }
        if newpos > self.specific.disk {
            return Err(RedologError::OutOfBounds);
        }
        self.imagepos = newpos;

        let extent_size = u64::from(self.specific.extent);
        let extent_index = (newpos / extent_size) as u32;
        if extent_index != self.extent_index {
            self.bitmap_stale = true;
        }
        self.extent_index = extent_index;
        self.extent_offset = ((newpos % extent_size) / SECTOR) as u32;

        Ok(newpos)
    }

    /// Read one sector at the current position. Returns 0 if the
    /// sector was never written, 512 otherwise.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, RedologError> {
        if buf.len() != SECTOR as usize {
            return Err(RedologError::BadLength(buf.len()));
        }

        let slot = *self
            .catalog
            .get(self.extent_index as usize)
            .ok_or(RedologError::OutOfBounds)?;
        if slot == PAGE_NOT_ALLOCATED {
            return Ok(0);
        }

        self.load_bitmap(slot)?;
        if self.bitmap[self.extent_offset as usize / 8] >> (self.extent_offset % 8) & 1 == 0 {
            return Ok(0);
        }

        let offset = self.block_offset(slot);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        self.seek(SeekFrom::Current(SECTOR as i64))?;

        Ok(SECTOR as usize)
    }

    /// Write one sector at the current position, allocating and
    /// zero-filling an extent if needed. Flush order is data, then
    /// bitmap, then catalog, so a torn write can never claim a sector
    /// that was not fully stored.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, RedologError> {
        if buf.len() != SECTOR as usize {
            return Err(RedologError::BadLength(buf.len()));
        }

        let index = self.extent_index as usize;
        if index >= self.catalog.len() {
            return Err(RedologError::OutOfBounds);
        }

        let mut update_catalog = false;
        if self.catalog[index] == PAGE_NOT_ALLOCATED {
            if self.extent_next >= { self.specific.catalog } {
                return Err(RedologError::CatalogFull);
            }
            debug!("redolog: allocating new extent at slot {}", self.extent_next);

            self.catalog[index] = self.extent_next;
            self.extent_next += 1;

            let zero = [0u8; SECTOR as usize];
            self.file
                .seek(SeekFrom::Start(self.extent_base(self.catalog[index])))?;
            for _ in 0..self.bitmap_blocks + self.extent_blocks {
                self.file.write_all(&zero)?;
            }
            update_catalog = true;
        }
        let slot = self.catalog[index];

        self.file.seek(SeekFrom::Start(self.block_offset(slot)))?;
        self.file.write_all(buf)?;

        self.load_bitmap(slot)?;
        let byte = self.extent_offset as usize / 8;
        let mask = 1u8 << (self.extent_offset % 8);
        if self.bitmap[byte] & mask == 0 {
            self.bitmap[byte] |= mask;
            self.file.seek(SeekFrom::Start(self.extent_base(slot)))?;
            self.file.write_all(&self.bitmap)?;
        }

        if update_catalog {
            let offset = u64::from(STANDARD_HEADER_SIZE) + u64::from(self.extent_index) * 4;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&slot.to_le_bytes())?;
        }

        self.seek(SeekFrom::Current(SECTOR as i64))?;
        Ok(SECTOR as usize)
    }

    fn load_bitmap(&mut self, slot: u32) -> Result<(), RedologError> {
        if !self.bitmap_stale {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.extent_base(slot)))?;
        self.file.read_exact(&mut self.bitmap)?;
        self.bitmap_stale = false;
        Ok(())
    }

    /// File offset of an allocated extent's bitmap.
    fn extent_base(&self, slot: u32) -> u64 {
        u64::from(STANDARD_HEADER_SIZE)
            + u64::from({ self.specific.catalog }) * 4
            + SECTOR * u64::from(slot) * u64::from(self.extent_blocks + self.bitmap_blocks)
    }

    /// File offset of the current sector within an allocated extent.
    fn block_offset(&self, slot: u32) -> u64 {
        self.extent_base(slot) + SECTOR * u64::from(self.bitmap_blocks + self.extent_offset)
    }
}

fn header_bytes(standard: &StandardHeader, specific: &SpecificHeader) -> [u8; 512] {
    let mut buffer = [0u8; STANDARD_HEADER_SIZE as usize];
    buffer[..72].copy_from_slice(bytemuck::bytes_of(standard));
    buffer[72..96].copy_from_slice(bytemuck::bytes_of(specific));
    buffer
}

#[cfg(test)]
fn test_log(size: u64) -> Redolog {
    let file = tempfile::tempfile().unwrap();
    Redolog::create_from(file, SUBTYPE_VOLATILE, size).unwrap()
}

#[test]
fn absent_before_any_write() {
    let mut log = test_log(1 << 20);
    let mut buf = [0xAAu8; 512];
    for sector in [0u64, 1, 100, 2047] {
        log.seek(SeekFrom::Start(sector * 512)).unwrap();
        assert_eq!(log.read(&mut buf).unwrap(), 0);
    }
}

#[test]
fn write_read_round_trip() {
    let mut log = test_log(1 << 24);

    let mut sectors = Vec::new();
    for (i, &sector) in [0u64, 2, 7, 4096, 32000].iter().enumerate() {
        let data = [i as u8 + 1; 512];
        log.seek(SeekFrom::Start(sector * 512)).unwrap();
        assert_eq!(log.write(&data).unwrap(), 512);
        sectors.push((sector, data));
    }

    for (sector, data) in sectors {
        let mut buf = [0u8; 512];
        log.seek(SeekFrom::Start(sector * 512)).unwrap();
        assert_eq!(log.read(&mut buf).unwrap(), 512);
        assert_eq!(buf, data);
        // the neighbour in the same extent is still absent
        assert_eq!(log.read(&mut buf).unwrap(), 0);
    }
}

#[test]
fn sequential_position_advances() {
    let mut log = test_log(1 << 20);
    log.seek(SeekFrom::Start(0)).unwrap();
    log.write(&[1u8; 512]).unwrap();
    log.write(&[2u8; 512]).unwrap();

    log.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 512];
    log.read(&mut buf).unwrap();
    assert_eq!(buf[0], 1);
    log.read(&mut buf).unwrap();
    assert_eq!(buf[0], 2);
}

#[test]
fn unaligned_seek_rejected() {
    let mut log = test_log(1 << 20);
    assert!(matches!(
        log.seek(SeekFrom::Start(100)),
        Err(RedologError::Unaligned(100))
    ));
    assert!(matches!(
        log.seek(SeekFrom::Start(2 << 20)),
        Err(RedologError::OutOfBounds)
    ));
}

#[test]
fn reopen_finds_extents() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("redo.log");

    {
        let mut log = Redolog::create(&path, SUBTYPE_VOLATILE, 1 << 20).unwrap();
        log.seek(SeekFrom::Start(0)).unwrap();
        log.write(&[0x5A; 512]).unwrap();
        log.seek(SeekFrom::Start(8192)).unwrap();
        log.write(&[0xA5; 512]).unwrap();
    }

    let mut log = Redolog::open(&path, SUBTYPE_VOLATILE).unwrap();
    assert_eq!(log.size(), 1 << 20);
    assert_eq!(log.extent_next, 2);

    let mut buf = [0u8; 512];
    log.seek(SeekFrom::Start(8192)).unwrap();
    assert_eq!(log.read(&mut buf).unwrap(), 512);
    assert_eq!(buf, [0xA5; 512]);
    log.seek(SeekFrom::Start(512)).unwrap();
    assert_eq!(log.read(&mut buf).unwrap(), 0);
}

#[test]
fn rejects_foreign_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("not-a-log");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    assert!(matches!(
        Redolog::open(&path, SUBTYPE_VOLATILE),
        Err(RedologError::NoSignature)
    ));

    let mut log = Redolog::create(&path, SUBTYPE_VOLATILE, 1 << 20).unwrap();
    drop(log);
    assert!(matches!(
        Redolog::open(&path, SUBTYPE_GROWING),
        Err(RedologError::TypeMismatch)
    ));
    log = Redolog::open(&path, SUBTYPE_VOLATILE).unwrap();
    assert_eq!(log.size(), 1 << 20);
}

/// Hand-build a header sector: standard header plus the specific
/// fields shared by both versions. The caller appends the disk size
/// (at +84 for V1, +88 for the current version) and the catalog.
#[cfg(test)]
fn raw_header(subtype: &[u8], version: u32, catalog: u32, bitmap: u32, extent: u32) -> Vec<u8> {
    let mut buffer = vec![0u8; 512];
    buffer[..STANDARD_HEADER_MAGIC.len()].copy_from_slice(STANDARD_HEADER_MAGIC);
    buffer[32..32 + REDOLOG_TYPE.len()].copy_from_slice(REDOLOG_TYPE);
    buffer[48..48 + subtype.len()].copy_from_slice(subtype);
    buffer[64..68].copy_from_slice(&version.to_le_bytes());
    buffer[68..72].copy_from_slice(&STANDARD_HEADER_SIZE.to_le_bytes());
    buffer[72..76].copy_from_slice(&catalog.to_le_bytes());
    buffer[76..80].copy_from_slice(&bitmap.to_le_bytes());
    buffer[80..84].copy_from_slice(&extent.to_le_bytes());
    buffer
}

#[test]
fn v1_header_migrates() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("v1.log");

    let mut buffer = raw_header(b"Volatile", STANDARD_HEADER_V1, 4, 1, 4096);
    // the V1 layout has no timestamp, putting the disk size at +12
    buffer[84..92].copy_from_slice(&16384u64.to_le_bytes());
    // empty catalog
    buffer.extend_from_slice(&[0xFF; 16]);
    std::fs::write(&path, &buffer).unwrap();

    let mut log = Redolog::open(&path, SUBTYPE_VOLATILE).unwrap();
    assert_eq!(log.size(), 16384);
    assert_eq!(log.timestamp(), 0);

    let mut buf = [0u8; 512];
    log.seek(SeekFrom::Start(4096)).unwrap();
    assert_eq!(log.read(&mut buf).unwrap(), 0);
    log.write(&[3; 512]).unwrap();
    log.seek(SeekFrom::Start(4096)).unwrap();
    assert_eq!(log.read(&mut buf).unwrap(), 512);
    assert_eq!(buf, [3; 512]);
}

#[test]
fn undoable_subtype_accepted_on_open() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("undo.log");

    let mut buffer = raw_header(b"Undoable", STANDARD_HEADER_VERSION, 4, 1, 4096);
    buffer[88..96].copy_from_slice(&16384u64.to_le_bytes());
    buffer.extend_from_slice(&[0xFF; 16]);
    std::fs::write(&path, &buffer).unwrap();

    // the subtype must match what the caller asks for
    assert!(matches!(
        Redolog::open(&path, SUBTYPE_VOLATILE),
        Err(RedologError::TypeMismatch)
    ));

    let mut log = Redolog::open(&path, SUBTYPE_UNDOABLE).unwrap();
    assert_eq!(log.size(), 16384);
    // only Growing logs get their timestamp stamped on open
    assert_eq!(log.timestamp(), 0);

    let mut buf = [0u8; 512];
    log.seek(SeekFrom::Start(0)).unwrap();
    log.write(&[7; 512]).unwrap();
    log.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(log.read(&mut buf).unwrap(), 512);
    assert_eq!(buf, [7; 512]);
}

#[test]
fn growing_subtype_stamps_timestamp_on_open() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("grow.log");

    let mut buffer = raw_header(b"Growing", STANDARD_HEADER_VERSION, 4, 1, 4096);
    buffer[88..96].copy_from_slice(&16384u64.to_le_bytes());
    buffer.extend_from_slice(&[0xFF; 16]);
    std::fs::write(&path, &buffer).unwrap();

    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    let log = Redolog::open(&path, SUBTYPE_GROWING).unwrap();
    let (date, time) = fat_datetime(mtime);
    assert_eq!(log.timestamp(), u32::from(time) | (u32::from(date) << 16));
}

#[test]
fn catalog_full_is_permanent() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("full.log");

    // Hand-build a two-entry catalog whose one allocated slot already
    // claims the highest index, leaving no room for another extent.
    let mut buffer = raw_header(b"Volatile", STANDARD_HEADER_VERSION, 2, 1, 4096);
    buffer[88..96].copy_from_slice(&8192u64.to_le_bytes());
    buffer.extend_from_slice(&1u32.to_le_bytes());
    buffer.extend_from_slice(&[0xFF; 4]);
    // slot 1's bitmap and data, fully zeroed, plus slot 0's
    buffer.extend_from_slice(&vec![0u8; 2 * (512 + 4096)]);
    std::fs::write(&path, &buffer).unwrap();

    let mut log = Redolog::open(&path, SUBTYPE_VOLATILE).unwrap();
    assert_eq!(log.extent_next, 2);

    log.seek(SeekFrom::Start(4096)).unwrap();
    assert!(matches!(
        log.write(&[1; 512]),
        Err(RedologError::CatalogFull)
    ));
}
