//! Presents a host directory as a block device holding a FAT12/16/32
//! volume. Sector reads are synthesized on demand from the shadowed
//! directory; writes are captured in a volatile copy-on-write redo
//! log, and [`VirtualFatBlockDevice::commit_changes`] reconciles the
//! guest's modifications back into the host directory.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{info, warn};
use thiserror::Error;

mod array;
mod boot_region;
mod commit;
mod direntry;
mod fat_region;
mod geometry;
mod ingest;
mod mapping;
mod redolog;

pub use fat_region::FatType;
pub use redolog::{
    Redolog, RedologError, SUBTYPE_GROWING, SUBTYPE_UNDOABLE, SUBTYPE_VOLATILE,
};

use array::Array;
use direntry::{DirEntry, DIRENTRY_SIZE};
use fat_region::FileAllocationTable;
use mapping::{Mapping, MappingInfo};

#[cfg(target_endian = "big")]
compile_error!("Big-endian not supported");

/// Reserved sidecar filenames at the top of the shadowed directory.
pub const VVFAT_MBR: &str = "vvfat_mbr.bin";
pub const VVFAT_BOOT: &str = "vvfat_boot.bin";
pub const VVFAT_ATTR: &str = "vvfat_attr.cfg";

/// In-memory rendering of everything before the data region: MBR,
/// gap, boot sector and (for FAT32) FS-info and backup boot sectors.
const FIRST_SECTORS_SIZE: usize = 0xC000;

/// Varies the volume serial number between opens.
static VVFAT_COUNT: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Error)]
pub enum VfatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Redolog(#[from] RedologError),

    #[error("directory does not fit in FAT{fat_bits} (capacity {capacity} MB)")]
    CapacityExceeded { fat_bits: u32, capacity: String },

    #[error("file '{}' is larger than 2 GiB", .0.display())]
    FileTooLarge(PathBuf),

    #[error("boot sector file: unsupported FS type")]
    UnsupportedBootSector,

    #[error("geometry does not fit the reserved region")]
    UnsupportedGeometry,

    #[error("length {0} is not a multiple of the sector size")]
    BadLength(usize),

    #[error("offset {0:#x} is not sector-aligned")]
    Unaligned(u64),

    #[error("position is beyond the end of the disk")]
    OutOfBounds,
}

/// Which buffer the most recently loaded cluster lives in.
#[derive(Debug)]
enum ClusterSource {
    None,
    /// Byte offset into the directory entry table.
    Directory { offset: usize },
    /// The shadowed-file cluster buffer.
    FileBuffer,
}

#[derive(Debug)]
pub struct VirtualFatBlockDevice {
    first_sectors: Vec<u8>,
    offset_to_bootsector: u32,
    offset_to_fat: u32,
    offset_to_root_dir: u32,
    offset_to_data: u32,

    cluster_size: u32,
    sectors_per_cluster: u8,
    sectors_per_fat: u32,
    sector_count: u32,
    cluster_count: u32,
    max_fat_value: u32,
    first_cluster_of_root_dir: u32,
    root_entries: u16,
    reserved_sectors: u16,
    fat_type: FatType,

    cylinders: u32,
    heads: u32,
    spt: u32,
    volume_id: u32,

    fat: FileAllocationTable,
    directory: Array<DirEntry>,
    mapping: Array<Mapping>,

    /// One shadowed file kept open at a time, keyed by path.
    current_file: Option<(PathBuf, File)>,
    cluster_buffer: Vec<u8>,
    current_cluster: u32,
    current_source: ClusterSource,

    vvfat_path: PathBuf,
    sector_num: u32,

    vvfat_modified: bool,
    /// FAT image read back through the redo-log overlay; only live
    /// during a commit.
    fat2: Vec<u8>,
    redolog: Redolog,
    root_entries_dropped: u32,
}

const NO_CLUSTER: u32 = u32::MAX;

impl VirtualFatBlockDevice {
    /// Open a virtual volume shadowing `dir`.
    ///
    /// `size` selects the media: exactly 1,474,560 bytes makes a bare
    /// 1.44 MB floppy; anything else uses the default 1024x16x63 hard
    /// disk geometry (sidecar images override either). `redolog_name`
    /// is a template for the volatile redo log; `None`, an empty path
    /// and `"none"` all mean `<dir>/vvfat.dir`.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        size: u64,
        redolog_name: Option<&Path>,
    ) -> Result<Self, VfatError> {
        Self::open_inner(dir.as_ref(), size, None, redolog_name)
    }

    /// Open with an explicit hard-disk CHS geometry.
    pub fn open_with_geometry<P: AsRef<Path>>(
        dir: P,
        cylinders: u32,
        heads: u32,
        spt: u32,
        redolog_name: Option<&Path>,
    ) -> Result<Self, VfatError> {
        let size = u64::from(cylinders * heads * spt) * 512;
        Self::open_inner(dir.as_ref(), size, Some((cylinders, heads, spt)), redolog_name)
    }

    fn open_inner(
        dir: &Path,
        hd_size: u64,
        chs: Option<(u32, u32, u32)>,
        redolog_name: Option<&Path>,
    ) -> Result<Self, VfatError> {
        let geometry = geometry::detect(dir, hd_size, chs)?;
        let reserved_end = (geometry.offset_to_bootsector as usize
            + usize::from(geometry.reserved_sectors))
            * 512;
        if reserved_end > FIRST_SECTORS_SIZE {
            return Err(VfatError::UnsupportedGeometry);
        }
        let volume_id = 0xFABE_1AFD_u32.wrapping_add(VVFAT_COUNT.fetch_add(1, Ordering::Relaxed));

        let logname = match redolog_name {
            Some(name) if !name.as_os_str().is_empty() && name != Path::new("none") => {
                name.to_path_buf()
            }
            _ => dir.join("vvfat.dir"),
        };
        let redolog = Self::create_volatile_redolog(&logname, geometry.disk_size())?;

        let mut device = Self {
            first_sectors: vec![0; FIRST_SECTORS_SIZE],
            offset_to_bootsector: geometry.offset_to_bootsector,
            offset_to_fat: 0,
            offset_to_root_dir: 0,
            offset_to_data: 0,
            cluster_size: u32::from(geometry.sectors_per_cluster) * 512,
            sectors_per_cluster: geometry.sectors_per_cluster,
            sectors_per_fat: 0,
            sector_count: geometry.sector_count,
            cluster_count: 0,
            max_fat_value: geometry.fat_type.max_value(),
            first_cluster_of_root_dir: geometry.first_cluster_of_root_dir,
            root_entries: geometry.root_entries,
            reserved_sectors: geometry.reserved_sectors,
            fat_type: geometry.fat_type,
            cylinders: geometry.cylinders,
            heads: geometry.heads,
            spt: geometry.spt,
            volume_id,
            fat: FileAllocationTable::new(geometry.fat_type, 0),
            directory: Array::new(),
            mapping: Array::new(),
            current_file: None,
            cluster_buffer: Vec::new(),
            current_cluster: NO_CLUSTER,
            current_source: ClusterSource::None,
            vvfat_path: PathBuf::new(),
            sector_num: 0,
            vvfat_modified: false,
            fat2: Vec::new(),
            redolog,
            root_entries_dropped: 0,
        };

        device.init_directories(dir, &geometry)?;
        device.set_file_attributes()?;

        info!(
            "vvfat disk opened: directory is '{}', FAT{}",
            dir.display(),
            device.fat_type.bits()
        );
        Ok(device)
    }

    /// Create the redo log from the template `<logname>.XXXXXX` and
    /// unlink it right away, so it vanishes when the descriptor
    /// closes.
    fn create_volatile_redolog(logname: &Path, size: u64) -> Result<Redolog, VfatError> {
        let parent = match logname.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let prefix = format!(
            "{}.",
            logname
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "vvfat.dir".into())
        );
        let named = tempfile::Builder::new().prefix(&prefix).tempfile_in(parent)?;
        let (file, temp_path) = named.into_parts();
        info!("volatile redolog is '{}'", temp_path.display());
        drop(temp_path);
        Ok(Redolog::create_from(file, redolog::SUBTYPE_VOLATILE, size)?)
    }

    /// Whether the guest has written anywhere outside the reserved
    /// region. The caller decides whether to [`commit_changes`]
    /// before dropping the device.
    ///
    /// [`commit_changes`]: Self::commit_changes
    pub fn modified(&self) -> bool {
        self.vvfat_modified
    }

    /// Root directory entries that did not fit during ingestion
    /// (FAT12/16 only; the remaining files were dropped).
    pub fn root_entries_dropped(&self) -> u32 {
        self.root_entries_dropped
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Disk size in bytes.
    pub fn size(&self) -> u64 {
        u64::from(self.sector_count) * 512
    }

    /// CHS geometry, for callers that report it to their guest.
    pub fn chs_geometry(&self) -> (u32, u32, u32) {
        (self.cylinders, self.heads, self.spt)
    }

    /// Sector-granular seek.
    pub fn lseek(&mut self, pos: SeekFrom) -> Result<u64, VfatError> {
        let offset = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let position = u64::from(self.sector_num) * 512;
                position
                    .checked_add_signed(delta)
                    .ok_or(VfatError::OutOfBounds)?
            }
            SeekFrom::End(delta) => self
                .size()
                .checked_add_signed(delta)
                .ok_or(VfatError::OutOfBounds)?,
        };
        if offset % 512 != 0 {
            return Err(VfatError::Unaligned(offset));
        }
        let sector = offset / 512;
        if sector >= u64::from(self.sector_count) {
            return Err(VfatError::OutOfBounds);
        }
        self.redolog.seek(SeekFrom::Start(offset))?;
        self.sector_num = sector as u32;
        Ok(offset)
    }

    /// Read whole sectors at the current position. The redo log wins;
    /// everything else is synthesized from the volume structures or
    /// the shadowed files.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfatError> {
        if buf.len() % 512 != 0 {
            return Err(VfatError::BadLength(buf.len()));
        }

        for chunk in buf.chunks_exact_mut(512) {
            if self.redolog.read(chunk)? != 512 {
                let s = self.sector_num;
                if s < self.offset_to_data {
                    if s < self.offset_to_bootsector + u32::from(self.reserved_sectors) {
                        let offset = s as usize * 512;
                        chunk.copy_from_slice(&self.first_sectors[offset..offset + 512]);
                    } else if s - self.offset_to_fat < self.sectors_per_fat {
                        let offset = (s - self.offset_to_fat) as usize * 512;
                        chunk.copy_from_slice(&self.fat.as_bytes()[offset..offset + 512]);
                    } else if s - self.offset_to_fat - self.sectors_per_fat < self.sectors_per_fat {
                        // second FAT copy, same image
                        let offset =
                            (s - self.offset_to_fat - self.sectors_per_fat) as usize * 512;
                        chunk.copy_from_slice(&self.fat.as_bytes()[offset..offset + 512]);
                    } else {
                        let offset = (s - self.offset_to_root_dir) as usize * 512;
                        let bytes: &[u8] = bytemuck::cast_slice(self.directory.as_slice());
                        chunk.copy_from_slice(&bytes[offset..offset + 512]);
                    }
                } else {
                    let sector = s - self.offset_to_data;
                    let sector_in_cluster = sector % u32::from(self.sectors_per_cluster);
                    let cluster_num = sector / u32::from(self.sectors_per_cluster) + 2;
                    if self.load_cluster(cluster_num) {
                        let offset = sector_in_cluster as usize * 512;
                        chunk.copy_from_slice(&self.cluster_slice()[offset..offset + 512]);
                    } else {
                        chunk.fill(0);
                    }
                }
                self.redolog
                    .seek(SeekFrom::Start(u64::from(self.sector_num + 1) * 512))?;
            }
            self.sector_num += 1;
        }
        Ok(buf.len())
    }

    /// Write whole sectors at the current position. The MBR, boot
    /// sector and FS-info sector are overlaid in place (and do not
    /// count as volume modifications); other reserved sectors are
    /// ignored; everything else goes to the redo log.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, VfatError> {
        if buf.len() % 512 != 0 {
            return Err(VfatError::BadLength(buf.len()));
        }

        for chunk in buf.chunks_exact(512) {
            let mut update_imagepos = true;
            let s = self.sector_num;
            if s == 0 {
                // partition table and disk signature survive
                self.first_sectors[..0x1B8].copy_from_slice(&chunk[..0x1B8]);
            } else if s == self.offset_to_bootsector {
                let offset = s as usize * 512;
                self.first_sectors[offset..offset + 512].copy_from_slice(chunk);
            } else if self.fat_type == FatType::Fat32 && s == self.offset_to_bootsector + 1 {
                let offset = s as usize * 512;
                self.first_sectors[offset..offset + 512].copy_from_slice(chunk);
            } else if s < self.offset_to_bootsector + u32::from(self.reserved_sectors) {
                log::debug!("write ignored: sector={s}");
            } else {
                self.vvfat_modified = true;
                update_imagepos = false;
                self.redolog.write(chunk)?;
            }
            self.sector_num += 1;
            if update_imagepos {
                self.redolog
                    .seek(SeekFrom::Start(u64::from(self.sector_num) * 512))?;
            }
        }
        Ok(buf.len())
    }

    pub(crate) fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.offset_to_data + (cluster - 2) * u32::from(self.sectors_per_cluster)
    }

    fn close_current_file(&mut self) {
        self.current_file = None;
        self.current_cluster = NO_CLUSTER;
        self.current_source = ClusterSource::None;
    }

    /// Cache one open shadowed file, keyed by path.
    fn open_file(&mut self, path: &Path) -> io::Result<()> {
        let cached = self
            .current_file
            .as_ref()
            .is_some_and(|(current, _)| current == path);
        if !cached {
            let file = File::open(path)?;
            self.close_current_file();
            self.current_file = Some((path.to_path_buf(), file));
        }
        Ok(())
    }

    /// Make `cluster_num` the current cluster. Returns false when the
    /// cluster is unmapped or the shadowed file cannot be read; the
    /// caller serves zeroes then.
    fn load_cluster(&mut self, cluster_num: u32) -> bool {
        if self.current_cluster == cluster_num {
            return true;
        }

        let Some(index) = mapping::find_for_cluster(&self.mapping, cluster_num) else {
            return false;
        };
        let (begin, info, path) = {
            let mapping = &self.mapping[index];
            (mapping.begin, mapping.info.clone(), mapping.path.clone())
        };

        match info {
            MappingInfo::Directory {
                first_dir_index, ..
            } => {
                let offset = self.cluster_size as usize * (cluster_num - begin) as usize
                    + DIRENTRY_SIZE * first_dir_index;
                self.close_current_file();
                self.current_source = ClusterSource::Directory { offset };
                self.current_cluster = cluster_num;
                true
            }
            MappingInfo::File { offset: file_offset } => {
                if let Err(error) = self.open_file(&path) {
                    warn!("can't open '{}': {error}", path.display());
                    return false;
                }
                let offset = u64::from(cluster_num - begin) * u64::from(self.cluster_size)
                    + u64::from(file_offset);
                let cluster_size = self.cluster_size as usize;
                self.cluster_buffer.resize(cluster_size, 0);
                let file = &mut self.current_file.as_mut().unwrap().1;
                if file.seek(SeekFrom::Start(offset)).is_err() {
                    self.current_cluster = NO_CLUSTER;
                    return false;
                }
                let mut filled = 0;
                loop {
                    match file.read(&mut self.cluster_buffer[filled..]) {
                        Ok(0) => break,
                        Ok(n) => {
                            filled += n;
                            if filled == cluster_size {
                                break;
                            }
                        }
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => {
                            self.current_cluster = NO_CLUSTER;
                            return false;
                        }
                    }
                }
                // short reads serve a zeroed tail
                self.cluster_buffer[filled..].fill(0);
                self.current_source = ClusterSource::FileBuffer;
                self.current_cluster = cluster_num;
                true
            }
            MappingInfo::Undefined => false,
        }
    }

    fn cluster_slice(&self) -> &[u8] {
        match self.current_source {
            ClusterSource::Directory { offset } => {
                let bytes: &[u8] = bytemuck::cast_slice(self.directory.as_slice());
                &bytes[offset..offset + self.cluster_size as usize]
            }
            ClusterSource::FileBuffer => &self.cluster_buffer,
            ClusterSource::None => unreachable!("no cluster loaded"),
        }
    }
}

impl Seek for VirtualFatBlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.lseek(pos)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
    }
}

impl Read for VirtualFatBlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        VirtualFatBlockDevice::read(self, buf)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
    }
}

impl Write for VirtualFatBlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        VirtualFatBlockDevice::write(self, buf)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
fn open_test_volume(dir: &Path) -> VirtualFatBlockDevice {
    // 64x16x63 sectors, ~31 MiB: FAT16 with 4-sector clusters
    VirtualFatBlockDevice::open_with_geometry(dir, 64, 16, 63, None).unwrap()
}

#[cfg(test)]
impl VirtualFatBlockDevice {
    fn sector(&mut self, sector: u32) -> [u8; 512] {
        let mut buffer = [0u8; 512];
        self.lseek(SeekFrom::Start(u64::from(sector) * 512)).unwrap();
        self.read(&mut buffer).unwrap();
        buffer
    }

    fn put_sector(&mut self, sector: u32, buffer: &[u8; 512]) {
        self.lseek(SeekFrom::Start(u64::from(sector) * 512)).unwrap();
        self.write(buffer).unwrap();
    }
}

#[test]
fn empty_directory_fat16() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut vfat = open_test_volume(dir.path());

    let mbr = vfat.sector(0);
    assert_eq!(&mbr[0x1FE..], &[0x55, 0xAA]);
    assert_eq!(mbr[0x1BE], 0x80); // bootable
    assert_eq!(mbr[0x1BE + 4], 0x06); // FAT16 partition

    let boot = vfat.sector(63);
    assert_eq!(&boot[0x1FE..], &[0x55, 0xAA]);
    assert_eq!(&boot[3..11], b"MSWIN4.1");
    assert_eq!(&boot[54..62], b"FAT16   ");

    let fat = vfat.sector(vfat.offset_to_fat);
    assert_eq!(&fat[..4], &[0xF8, 0xFF, 0xFF, 0xFF]);
    // both FAT copies serve the same image
    let fat2 = vfat.sector(vfat.offset_to_fat + vfat.sectors_per_fat);
    assert_eq!(fat, fat2);

    let root = vfat.sector(vfat.offset_to_root_dir);
    assert_eq!(&root[..11], b"VIRTUAL FAT");
    assert_eq!(root[11], 0x28); // archive | volume label

    assert!(!vfat.modified());
    assert_eq!(vfat.root_entries_dropped(), 0);
}

#[test]
fn floppy_volume() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut vfat = VirtualFatBlockDevice::open(dir.path(), 1_474_560, None).unwrap();

    assert_eq!(vfat.fat_type(), FatType::Fat12);
    assert_eq!(vfat.sector_count(), 2880);

    // no MBR: sector 0 is the boot sector
    let boot = vfat.sector(0);
    assert_eq!(&boot[54..62], b"FAT12   ");
    assert_eq!(boot[21], 0xF0); // media type
    assert_eq!(&boot[0x1FE..], &[0x55, 0xAA]);

    let fat = vfat.sector(vfat.offset_to_fat);
    assert_eq!(&fat[..3], &[0xF0, 0xFF, 0xFF]);
}

#[test]
fn single_file_layout() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    let mut vfat = open_test_volume(dir.path());

    // volume label, one long-name entry, then the short entry
    let entry = vfat.directory[2];
    assert_eq!(&entry.name, b"HELLO   ");
    assert_eq!(&entry.extension, b"TXT");
    assert_eq!({ entry.size }, 3);
    assert_eq!({ entry.begin }, 2);
    assert_eq!({ entry.begin_hi }, 0);
    assert!(entry.attributes.archive());
    assert!(!entry.attributes.directory());

    let lfn = vfat.directory[1];
    assert!(lfn.is_long_name());
    assert_eq!(lfn.name[0], 0x41); // first and last of a one-entry chain
    assert_eq!(lfn.name[1], b'h');
    assert_eq!(lfn.reserved[1], direntry::fat_chksum(&entry));

    // the file's cluster chain is a single end-of-chain entry
    assert_eq!(fat_region::entry(vfat.fat.as_bytes(), FatType::Fat16, 2), 0xFFFF);

    let data = vfat.sector(vfat.offset_to_data);
    assert_eq!(&data[..3], b"abc");
    assert_eq!(&data[3..], &[0u8; 509]);
}

#[test]
fn long_filename_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("A Very Long Name.txt"), b"x").unwrap();
    let vfat = open_test_volume(dir.path());

    // 20 characters need two long-name entries
    let first = vfat.directory[1];
    let second = vfat.directory[2];
    let short = vfat.directory[3];

    assert!(first.is_long_name());
    assert!(second.is_long_name());
    assert_eq!(first.name[0], 2 | 0x40);
    assert_eq!(second.name[0], 1);
    assert_eq!(&short.name, b"AVERYLON");
    assert_eq!(&short.extension, b"TXT");

    let chksum = direntry::fat_chksum(&short);
    assert_eq!(first.reserved[1], chksum);
    assert_eq!(second.reserved[1], chksum);

    // the physically last entry holds the first 13 characters
    let entry_bytes = bytemuck::bytes_of(&second);
    let stored: Vec<u8> = direntry::LFN_MAP.iter().map(|&i| entry_bytes[i]).collect();
    assert_eq!(&stored, b"A Very Long N");
}

#[test]
fn guest_write_then_commit_rewrites_file() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    let mut vfat = open_test_volume(dir.path());

    // overwrite the file's first (and only) cluster
    let mut data = [0u8; 512];
    data[..5].copy_from_slice(b"HELLO");
    vfat.put_sector(vfat.offset_to_data, &data);
    assert!(vfat.modified());

    // the redo log wins on read-back
    assert_eq!(vfat.sector(vfat.offset_to_data), data);

    // update the directory entry the way a guest would: new size and
    // modification time
    let root_sector = vfat.offset_to_root_dir;
    let mut root = vfat.sector(root_sector);
    {
        let entry: &mut DirEntry = bytemuck::from_bytes_mut(&mut root[64..96]);
        entry.size = 5;
        entry.mtime = (10 << 11) | (30 << 5) | (24 / 2);
        entry.mdate = 15 | (4 << 5) | ((2012 - 1980) << 9);
    }
    vfat.put_sector(root_sector, &root);

    vfat.commit_changes().unwrap();
    assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"HELLO");

    let mtime = std::fs::metadata(dir.path().join("hello.txt"))
        .unwrap()
        .modified()
        .unwrap();
    let expected =
        direntry::decode_fat_datetime(15 | (4 << 5) | ((2012 - 1980) << 9), (10 << 11) | (30 << 5) | 12)
            .unwrap();
    assert_eq!(mtime, expected);
}

#[test]
fn guest_delete_then_commit_unlinks() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    let mut vfat = open_test_volume(dir.path());

    let root_sector = vfat.offset_to_root_dir;
    let mut root = vfat.sector(root_sector);
    root[32] = 0xE5; // long-name entry
    root[64] = 0xE5; // short entry
    vfat.put_sector(root_sector, &root);
    assert!(vfat.modified());

    vfat.commit_changes().unwrap();
    assert!(!dir.path().join("hello.txt").exists());
}

#[test]
fn guest_rename_preserving_ctime_renames_host_file() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
    let mut vfat = open_test_volume(dir.path());

    let root_sector = vfat.offset_to_root_dir;
    let mut root = vfat.sector(root_sector);
    // "a.txt" -> "b.txt" in both the long and the short entry,
    // leaving ctime/cdate untouched
    assert_eq!(root[33], b'a');
    root[33] = b'b';
    assert_eq!(&root[64..66], b"A ");
    root[64] = b'B';
    vfat.put_sector(root_sector, &root);

    vfat.commit_changes().unwrap();
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"one");
}

#[test]
fn guest_created_file_appears_on_host() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("seed.txt"), b"seed").unwrap();
    let mut vfat = open_test_volume(dir.path());

    // hand-write a new file: data into a free cluster, a chain entry
    // into the FAT, and a fresh directory entry
    let free_cluster = 3u32;
    let mut data = [0u8; 512];
    data[..3].copy_from_slice(b"new");
    vfat.put_sector(vfat.cluster_to_sector(free_cluster), &data);

    let fat_sector = vfat.offset_to_fat;
    let mut fat = vfat.sector(fat_sector);
    fat[6..8].copy_from_slice(&0xFFFFu16.to_le_bytes());
    vfat.put_sector(fat_sector, &fat);

    let root_sector = vfat.offset_to_root_dir;
    let mut root = vfat.sector(root_sector);
    {
        // first free slot after label + seed.txt's two entries
        let entry: &mut DirEntry = bytemuck::from_bytes_mut(&mut root[96..128]);
        entry.name.copy_from_slice(b"NEW     ");
        entry.extension.copy_from_slice(b"TXT");
        entry.attributes = direntry::Attributes::new_with_raw_value(0x20);
        entry.size = 3;
        entry.set_start_cluster(free_cluster);
        entry.mdate = 15 | (4 << 5) | ((2012 - 1980) << 9);
        entry.mtime = 10 << 11;
    }
    vfat.put_sector(root_sector, &root);

    vfat.commit_changes().unwrap();
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"new");
    // the seed file survives untouched
    assert_eq!(std::fs::read(dir.path().join("seed.txt")).unwrap(), b"seed");
}

#[test]
fn commit_without_guest_changes_touches_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/nested.txt"), b"nested").unwrap();

    let mut vfat = open_test_volume(dir.path());
    vfat.sector(vfat.offset_to_data);
    assert!(!vfat.modified());

    let before = std::fs::metadata(dir.path().join("hello.txt")).unwrap();
    vfat.commit_changes().unwrap();

    assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"abc");
    assert_eq!(
        std::fs::read(dir.path().join("sub/nested.txt")).unwrap(),
        b"nested"
    );
    let after = std::fs::metadata(dir.path().join("hello.txt")).unwrap();
    assert_eq!(
        before.modified().unwrap(),
        after.modified().unwrap()
    );
}

#[test]
fn subdirectory_tree_and_mapping_invariants() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/inner.txt"), vec![7u8; 5000]).unwrap();
    std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
    let vfat = open_test_volume(dir.path());

    // mappings are sorted, non-empty and disjoint
    for window in vfat.mapping.windows(2) {
        assert!(window[0].begin < window[0].end);
        assert!(window[0].end <= window[1].begin);
    }

    let fat_entry = |cluster| fat_region::entry(vfat.fat.as_bytes(), vfat.fat_type, cluster);
    for mapping in vfat.mapping.iter().skip(1) {
        // every non-root mapping's chain is begin, begin+1, ..., EOC
        for cluster in mapping.begin..mapping.end - 1 {
            assert_eq!(fat_entry(cluster), cluster + 1);
        }
        assert!(fat_entry(mapping.end - 1) >= vfat.max_fat_value - 7);

        // and its directory entry points at its first cluster
        let entry = vfat.directory[mapping.dir_index];
        assert_eq!(entry.start_cluster(), mapping.begin);
    }

    // the subdirectory got dot entries pointing at self and root
    let sub = vfat
        .mapping
        .iter()
        .find(|mapping| mapping.is_directory() && mapping.path.ends_with("sub"))
        .unwrap();
    let MappingInfo::Directory {
        first_dir_index, ..
    } = sub.info
    else {
        unreachable!()
    };
    let dot = vfat.directory[first_dir_index];
    let dotdot = vfat.directory[first_dir_index + 1];
    assert_eq!(&dot.name, b".       ");
    assert_eq!(&dotdot.name, b"..      ");
    assert_eq!(dot.start_cluster(), sub.begin);
    assert_eq!(dotdot.start_cluster(), 0);

    // 5000 bytes need three 2 KiB clusters
    let inner = vfat
        .mapping
        .iter()
        .find(|mapping| mapping.path.ends_with("inner.txt"))
        .unwrap();
    assert_eq!(inner.end - inner.begin, 3);
}

#[test]
fn fat32_volume_layout() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    // 4200x16x63 sectors, ~2 GiB: FAT32
    let mut vfat =
        VirtualFatBlockDevice::open_with_geometry(dir.path(), 4200, 16, 63, None).unwrap();
    assert_eq!(vfat.fat_type(), FatType::Fat32);

    let boot = vfat.sector(63);
    assert_eq!(&boot[82..90], b"FAT32   ");
    assert_eq!(&boot[3..11], b"MSWIN4.1");

    // FS-info sector follows the boot sector
    let info = vfat.sector(64);
    assert_eq!(&info[..4], &0x4161_5252u32.to_le_bytes());
    assert_eq!(&info[0x1E4..0x1E8], &0x6141_7272u32.to_le_bytes());

    // backup boot sector at +6
    let backup = vfat.sector(69);
    assert_eq!(boot, backup);

    // the root directory is cluster 2; its first entry is the label
    let root = vfat.sector(vfat.cluster_to_sector(2));
    assert_eq!(&root[..11], b"VIRTUAL FAT");

    // FAT entry 0 carries the media byte
    let fat = vfat.sector(vfat.offset_to_fat);
    assert_eq!(&fat[..4], &[0xF8, 0xFF, 0xFF, 0x0F]);
}

#[test]
fn byte_granular_reads_through_io_traits() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut vfat = open_test_volume(dir.path());

    let mut by_sector = Vec::new();
    for sector in 0..4 {
        by_sector.extend(vfat.sector(sector));
    }

    vfat.seek(SeekFrom::Start(0)).unwrap();
    let mut by_read = vec![0u8; 4 * 512];
    vfat.read_exact(&mut by_read).unwrap();
    assert_eq!(by_sector, by_read);

    // sub-sector lengths violate the contract
    let mut one = [0u8; 1];
    assert!(Read::read(&mut vfat, &mut one).is_err());
}

#[test]
fn oversized_file_fails_open() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = std::fs::File::create(dir.path().join("huge.bin")).unwrap();
    file.set_len(0x8000_0000).unwrap();
    drop(file);

    match VirtualFatBlockDevice::open_with_geometry(dir.path(), 64, 16, 63, None) {
        Err(VfatError::FileTooLarge(path)) => assert!(path.ends_with("huge.bin")),
        other => panic!("expected FileTooLarge, got {other:?}"),
    }
}

#[test]
fn overfull_volume_fails_open() {
    let dir = tempfile::TempDir::new().unwrap();
    // ~2 MiB volume cannot hold 3 MiB of data
    std::fs::write(dir.path().join("big.bin"), vec![1u8; 3 << 20]).unwrap();
    match VirtualFatBlockDevice::open_with_geometry(dir.path(), 4, 16, 63, None) {
        Err(VfatError::CapacityExceeded { fat_bits: 16, .. }) => {}
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[test]
fn attribute_sidecar_restores_bits() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    std::fs::write(dir.path().join(VVFAT_ATTR), "\"hello.txt\":HR\n").unwrap();
    let vfat = open_test_volume(dir.path());

    let entry = vfat.directory[2];
    assert!(entry.attributes.hidden());
    assert!(entry.attributes.read_only());
    assert!(entry.attributes.archive());

    // the sidecar itself is not part of the volume
    assert_eq!(vfat.directory.iter().filter(|e| e.is_long_name()).count(), 1);
}
