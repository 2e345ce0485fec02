//! Directory ingestion: builds the directory entry table, the mapping
//! table and the FAT from the shadowed directory, and renders the
//! first sectors (MBR, boot sector, FS-info).

use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

use itertools::Itertools;
use log::warn;

use crate::boot_region::{
    partition_type, BootSector, Chs, InfoSector, Mbr, BOOT_MAGIC, INFOSECTOR_SIGNATURE1,
    INFOSECTOR_SIGNATURE2, NT_DISK_SIGNATURE,
};
use crate::direntry::{fat_chksum, fat_datetime, Attributes, DirEntry, ATTR_LONG_NAME, LFN_MAP};
use crate::fat_region::{FatType, FileAllocationTable};
use crate::geometry::Geometry;
use crate::mapping::{self, MappingInfo};
use crate::{VfatError, VirtualFatBlockDevice, VVFAT_ATTR, VVFAT_BOOT, VVFAT_MBR};

const VOLUME_LABEL: &[u8; 11] = b"VIRTUAL FAT";

/// Characters a short name may not contain.
const FORBIDDEN: &[u8] = b".*?<>|\":/\\[];,+='";

fn stamp_times(entry: &mut DirEntry, meta: &Metadata) {
    let created = meta
        .created()
        .or_else(|_| meta.modified())
        .unwrap_or(UNIX_EPOCH);
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    let accessed = meta.accessed().unwrap_or(modified);

    let (cdate, ctime) = fat_datetime(created);
    entry.ctime = ctime;
    entry.cdate = cdate;
    let (adate, _) = fat_datetime(accessed);
    entry.adate = adate;
    let (mdate, mtime) = fat_datetime(modified);
    entry.mtime = mtime;
    entry.mdate = mdate;
}

impl VirtualFatBlockDevice {
    pub(crate) fn init_directories(
        &mut self,
        dirname: &Path,
        geometry: &Geometry,
    ) -> Result<(), VfatError> {
        self.cluster_size = u32::from(self.sectors_per_cluster) * 0x200;

        if let Some(image) = &geometry.mbr_image {
            self.first_sectors[..512].copy_from_slice(&image[..]);
        } else if self.offset_to_bootsector > 0 {
            self.init_mbr();
        }

        let volume_sector_count = self.sector_count - self.offset_to_bootsector;
        if !geometry.use_boot_file {
            let usable = u64::from(volume_sector_count)
                - u64::from(self.reserved_sectors)
                - u64::from(self.root_entries / 16);
            // each cluster costs its data plus one entry in both FATs
            self.cluster_count = ((usable * 0x200)
                / (u64::from(self.cluster_size) + u64::from(self.fat_type.bits()) / 4))
                as u32;
            let fat_bytes =
                (u64::from(self.cluster_count) + 2) * u64::from(self.fat_type.bits()) / 8;
            self.sectors_per_fat = fat_bytes.div_ceil(0x200) as u32;
        } else {
            let image = geometry.boot_image.as_ref().unwrap();
            let bs: BootSector = bytemuck::pod_read_unaligned(&image[..]);
            self.sectors_per_fat = match self.fat_type {
                FatType::Fat32 => bs.fat32().sectors_per_fat,
                _ => u32::from({ bs.sectors_per_fat }),
            };
        }

        self.offset_to_fat = self.offset_to_bootsector + u32::from(self.reserved_sectors);
        self.offset_to_root_dir = self.offset_to_fat + self.sectors_per_fat * 2;
        self.offset_to_data = self.offset_to_root_dir + u32::from(self.root_entries) / 16;
        if geometry.use_boot_file {
            self.cluster_count =
                (self.sector_count - self.offset_to_data) / u32::from(self.sectors_per_cluster);
        }

        self.fat = FileAllocationTable::new(self.fat_type, self.sectors_per_fat);

        // volume label entry
        {
            let label = self.directory.next();
            label.attributes = Attributes::new_with_raw_value(0x28);
            label.mdate = 0x3D81;
            label.mtime = 0x6000;
            label.name.copy_from_slice(&VOLUME_LABEL[..8]);
            label.extension.copy_from_slice(&VOLUME_LABEL[8..]);
        }

        // root mapping
        {
            let root_index = self.mapping.next_index();
            let root = &mut self.mapping[root_index];
            root.begin = 0;
            root.dir_index = 0;
            root.info = MappingInfo::Directory {
                parent_mapping_index: None,
                first_dir_index: 0,
            };
            root.path = dirname.to_path_buf();
            root.read_only = false;
        }
        self.vvfat_path = dirname.to_path_buf();

        let mut cluster = self.first_cluster_of_root_dir;
        let mut index = 0;
        while index < self.mapping.len() {
            // the FAT12/16 root directory lives outside the data
            // region and gets no chain
            let mut fix_fat = cluster != 0;

            if self.mapping[index].is_directory() {
                self.mapping[index].begin = cluster;
                self.read_directory(index)?;
            } else {
                debug_assert_eq!(self.mapping[index].info, MappingInfo::Undefined);
                // for files, `end` still holds the byte size
                let size = self.mapping[index].end;
                self.mapping[index].begin = cluster;
                self.mapping[index].info = MappingInfo::File { offset: 0 };
                if size > 0 {
                    let end = cluster + 1 + (size - 1) / self.cluster_size;
                    self.mapping[index].end = end;
                    let dir_index = self.mapping[index].dir_index;
                    self.directory[dir_index].set_start_cluster(cluster);
                } else {
                    self.mapping[index].end = cluster + 1;
                    fix_fat = false;
                }
            }

            let (begin, end) = (self.mapping[index].begin, self.mapping[index].end);
            debug_assert!(begin < end);
            cluster = end;

            if cluster >= self.cluster_count + 2 {
                let capacity = match self.fat_type {
                    FatType::Fat12 if self.sector_count == 2880 => "1.44".to_owned(),
                    FatType::Fat12 => "2.88".to_owned(),
                    _ => format!("{}", self.sector_count >> 11),
                };
                return Err(VfatError::CapacityExceeded {
                    fat_bits: self.fat_type.bits(),
                    capacity,
                });
            }

            if fix_fat {
                for (current, next) in (begin..end).tuple_windows() {
                    self.fat.set(current, next);
                }
                self.fat.set(end - 1, self.max_fat_value);
            }

            index += 1;
        }

        debug_assert!(self.fat_type == FatType::Fat32 || self.mapping[0].end == 2);

        // the FAT signature
        self.fat.set(0, self.max_fat_value);
        self.fat.set(1, self.max_fat_value);

        let bootsector_offset = self.offset_to_bootsector as usize * 0x200;
        if let Some(image) = &geometry.boot_image {
            self.first_sectors[bootsector_offset..bootsector_offset + 512]
                .copy_from_slice(&image[..]);
        } else {
            let spt = self.spt;
            let heads = self.heads;
            let volume_id = self.volume_id;
            let bs: &mut BootSector = bytemuck::from_bytes_mut(
                &mut self.first_sectors[bootsector_offset..bootsector_offset + 512],
            );
            bs.jump = [
                0xEB,
                if self.fat_type == FatType::Fat32 {
                    0x58
                } else {
                    0x3E
                },
                0x90,
            ];
            // Win95/98 needs this to detect FAT32
            bs.name = *b"MSWIN4.1";
            bs.sector_size = 0x200;
            bs.sectors_per_cluster = self.sectors_per_cluster;
            bs.reserved_sectors = self.reserved_sectors;
            bs.number_of_fats = 2;
            bs.total_sectors16 = if volume_sector_count > 0xFFFF {
                0
            } else {
                volume_sector_count as u16
            };
            bs.media_type = geometry.media_type();
            bs.sectors_per_track = spt as u16;
            bs.number_of_heads = heads as u16;
            bs.hidden_sectors = self.offset_to_bootsector;
            bs.total_sectors = if volume_sector_count > 0xFFFF {
                volume_sector_count
            } else {
                0
            };
            match self.fat_type {
                FatType::Fat32 => {
                    let sectors_per_fat = self.sectors_per_fat;
                    let first_cluster_of_root_dir = self.first_cluster_of_root_dir;
                    let ext = bs.fat32_mut();
                    ext.sectors_per_fat = sectors_per_fat;
                    ext.first_cluster_of_root_dir = first_cluster_of_root_dir;
                    ext.info_sector = 1;
                    ext.backup_boot_sector = 6;
                    ext.drive_number = 0x80;
                    ext.signature = 0x29;
                    ext.id = volume_id;
                    ext.volume_label = *VOLUME_LABEL;
                    ext.fat_type = *FatType::Fat32.name();
                }
                _ => {
                    bs.root_entries = self.root_entries;
                    bs.sectors_per_fat = self.sectors_per_fat as u16;
                    let fat_type = self.fat_type;
                    let ext = bs.fat16_mut();
                    ext.drive_number = if fat_type == FatType::Fat12 { 0 } else { 0x80 };
                    ext.signature = 0x29;
                    ext.id = volume_id;
                    ext.volume_label = *VOLUME_LABEL;
                    ext.fat_type = *fat_type.name();
                }
            }
            bs.magic = BOOT_MAGIC;
        }

        // FAT entry 0 carries the media byte
        let media_type = self.first_sectors[bootsector_offset + 21];
        self.fat.as_bytes_mut()[0] = media_type;

        if self.fat_type == FatType::Fat32 {
            // backup boot sector
            let backup_offset = (self.offset_to_bootsector as usize + 6) * 0x200;
            self.first_sectors
                .copy_within(bootsector_offset..bootsector_offset + 512, backup_offset);

            let cluster_count = self.cluster_count;
            let info_offset = (self.offset_to_bootsector as usize + 1) * 0x200;
            let info: &mut InfoSector =
                bytemuck::from_bytes_mut(&mut self.first_sectors[info_offset..info_offset + 512]);
            info.signature1 = INFOSECTOR_SIGNATURE1;
            info.signature2 = INFOSECTOR_SIGNATURE2;
            info.free_clusters = cluster_count - cluster + 2;
            info.mra_cluster = 2;
            info.magic = BOOT_MAGIC;
        }

        Ok(())
    }

    fn init_mbr(&mut self) {
        let offset_to_bootsector = self.offset_to_bootsector;
        let sector_count = self.sector_count;
        let fat_type = self.fat_type;
        let (heads, spt) = (self.heads, self.spt);

        let mbr: &mut Mbr = bytemuck::from_bytes_mut(&mut self.first_sectors[..512]);
        mbr.nt_id = NT_DISK_SIGNATURE;

        let partition = &mut mbr.partitions[0];
        partition.attributes = 0x80; // bootable

        // LBA is used when the partition lies outside the CHS range
        let (start_chs, start_lba) = Chs::from_sector(offset_to_bootsector, heads, spt);
        let (end_chs, end_lba) = Chs::from_sector(sector_count - 1, heads, spt);
        partition.start_chs = start_chs;
        partition.end_chs = end_chs;
        partition.start_sector = offset_to_bootsector;
        partition.length_sectors = sector_count - offset_to_bootsector;
        partition.fs_type = partition_type(fat_type, start_lba || end_lba);

        mbr.magic = BOOT_MAGIC;
    }

    /// Enumerate one shadowed directory, appending directory entries
    /// and mappings for its children.
    fn read_directory(&mut self, mapping_index: usize) -> Result<(), VfatError> {
        let (dirname, first_cluster, parent_index) = {
            let mapping = &self.mapping[mapping_index];
            let MappingInfo::Directory {
                parent_mapping_index,
                ..
            } = mapping.info
            else {
                unreachable!("read_directory on a non-directory mapping");
            };
            (mapping.path.clone(), mapping.begin, parent_mapping_index)
        };

        let read_dir = match std::fs::read_dir(&dirname) {
            Ok(read_dir) => read_dir,
            Err(error) => {
                warn!("could not read directory '{}'", dirname.display());
                return Err(error.into());
            }
        };

        let is_root = first_cluster == self.first_cluster_of_root_dir;
        let first_dir_index = if is_root { 0 } else { self.directory.len() };
        if let MappingInfo::Directory {
            first_dir_index: stored,
            ..
        } = &mut self.mapping[mapping_index].info
        {
            *stored = first_dir_index;
        }

        if !is_root {
            // the top entries of a subdirectory
            let meta = std::fs::metadata(&dirname)?;
            let parent_path = self.mapping[parent_index.unwrap()].path.clone();
            let parent_meta = std::fs::metadata(&parent_path).unwrap_or(meta.clone());
            let first_cluster_of_parent = self.mapping[parent_index.unwrap()].begin;

            let dot = self.create_short_and_long_name(first_dir_index, ".", true);
            {
                let entry = &mut self.directory[dot];
                entry.attributes = Attributes::new_with_raw_value(0x10);
                stamp_times(entry, &meta);
                entry.set_start_cluster(first_cluster);
            }

            let dotdot = self.create_short_and_long_name(first_dir_index, "..", true);
            {
                let entry = &mut self.directory[dotdot];
                entry.attributes = Attributes::new_with_raw_value(0x10);
                stamp_times(entry, &parent_meta);
                entry.set_start_cluster(first_cluster_of_parent);
            }
        }

        let mut count = 0u32;
        for child in read_dir {
            let Ok(child) = child else { continue };
            let file_name = child.file_name();
            let filename = file_name.to_string_lossy().into_owned();
            let path = dirname.join(&file_name);

            // unreadable children are skipped
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };

            if is_root {
                let is_mbr_file = filename == VVFAT_MBR;
                let is_boot_file = filename == VVFAT_BOOT;
                let is_attr_file = filename == VVFAT_ATTR;
                if is_attr_file || ((is_mbr_file || is_boot_file) && meta.len() == 512) {
                    continue;
                }
            }

            if first_cluster == 0
                && self.directory.len() >= usize::from(self.root_entries) - 1
            {
                if self.root_entries_dropped == 0 {
                    warn!("too many entries in root directory, using only {count}");
                }
                self.root_entries_dropped += 1;
                continue;
            }

            if !meta.is_dir() && meta.len() > 0x7FFF_FFFF {
                warn!("file '{}' is larger than 2GB", path.display());
                return Err(VfatError::FileTooLarge(path));
            }

            count += 1;
            let dir_index = self.create_short_and_long_name(first_dir_index, &filename, false);
            {
                let entry = &mut self.directory[dir_index];
                entry.attributes =
                    Attributes::new_with_raw_value(if meta.is_dir() { 0x10 } else { 0x20 });
                entry.reserved = [0; 2];
                stamp_times(entry, &meta);
                entry.begin = 0; // assigned during cluster layout
                entry.begin_hi = 0;
                entry.size = if meta.is_dir() { 0 } else { meta.len() as u32 };
            }

            // only subdirectories and non-empty files get a mapping
            if meta.is_dir() || meta.len() > 0 {
                let new_index = self.mapping.next_index();
                let mapping = &mut self.mapping[new_index];
                mapping.begin = 0;
                mapping.end = meta.len() as u32;
                mapping.dir_index = dir_index;
                mapping.info = if meta.is_dir() {
                    MappingInfo::Directory {
                        parent_mapping_index: Some(mapping_index),
                        first_dir_index: 0,
                    }
                } else {
                    MappingInfo::Undefined
                };
                mapping.path = path;
                mapping.read_only = meta.permissions().readonly();
            }
        }

        // fill with zeroes up to the end of the cluster
        while self.directory.len() % (0x10 * usize::from(self.sectors_per_cluster)) != 0 {
            self.directory.next();
        }

        if self.fat_type != FatType::Fat32
            && mapping_index == 0
            && self.directory.len() < usize::from(self.root_entries)
        {
            self.directory
                .ensure_allocated(usize::from(self.root_entries) - 1);
        }

        let end = if first_cluster == 0 {
            2
        } else {
            first_cluster
                + ((self.directory.len() - first_dir_index) as u32 * 0x20) / self.cluster_size
        };
        let mapping = &mut self.mapping[mapping_index];
        mapping.end = end;
        let dir_index = mapping.dir_index;
        let begin = mapping.begin;
        self.directory[dir_index].set_start_cluster(begin);

        Ok(())
    }

    /// Append the long-name entries followed by the 8.3 short entry
    /// for `filename`, mangling short-name collisions against the
    /// directory's earlier siblings. Returns the short entry's index.
    fn create_short_and_long_name(
        &mut self,
        directory_start: usize,
        filename: &str,
        is_dot: bool,
    ) -> usize {
        if is_dot {
            let index = self.directory.next_index();
            let entry = &mut self.directory[index];
            entry.name = [0x20; 8];
            entry.extension = [0x20; 3];
            entry.name[..filename.len()].copy_from_slice(filename.as_bytes());
            return index;
        }

        let long_index = self.directory.len();
        self.create_long_filename(filename);

        // a short name contains no spaces
        let bytes: Vec<u8> = filename.bytes().filter(|&b| b != b' ').collect();

        // split at the last dot; a leading dot is part of the name
        let (base_len, extension_start) = match bytes.iter().rposition(|&b| b == b'.') {
            Some(dot) if dot > 0 => (dot.min(8), Some(dot + 1)),
            _ => (bytes.len().min(8), None),
        };

        let mut name11 = [0x20u8; 11];
        name11[..base_len].copy_from_slice(&bytes[..base_len]);
        if let Some(start) = extension_start {
            for (i, &b) in bytes[start..].iter().take(3).enumerate() {
                name11[8 + i] = b;
            }
        }

        // upcase and replace unwanted characters, ignoring the
        // trailing space padding of both fields
        let mut i: i32 = 10;
        while i >= 0 {
            if i == 10 || i == 7 {
                while i > 0 && name11[i as usize] == b' ' {
                    i -= 1;
                }
            }
            let c = name11[i as usize];
            if c < 0x20 || c > 0x7F || FORBIDDEN.contains(&c) {
                name11[i as usize] = b'_';
            } else {
                name11[i as usize] = c.to_ascii_uppercase();
            }
            i -= 1;
        }
        if name11[0] == 0xE5 {
            name11[0] = 0x05;
        }

        // mangle duplicates
        loop {
            let duplicate = (directory_start..self.directory.len()).any(|sibling| {
                let other = self.directory[sibling];
                !other.is_long_name()
                    && other.name[..] == name11[..8]
                    && other.extension[..] == name11[8..]
            });
            if !duplicate {
                break;
            }

            // use all 8 characters of the name
            if name11[7] == b' ' {
                let mut j = 6;
                while j > 0 && name11[j] == b' ' {
                    name11[j] = b'~';
                    j -= 1;
                }
            }

            // increment the counter, with carry
            let mut j = 7;
            while j > 0 && name11[j] == b'9' {
                name11[j] = b'0';
                j -= 1;
            }
            if j > 0 {
                if !name11[j].is_ascii_digit() {
                    name11[j] = b'0';
                } else {
                    name11[j] += 1;
                }
            }
        }

        let index = self.directory.next_index();
        {
            let entry = &mut self.directory[index];
            entry.name.copy_from_slice(&name11[..8]);
            entry.extension.copy_from_slice(&name11[8..]);
        }

        // propagate the checksum to the long-name entries
        let chksum = fat_chksum(&self.directory[index]);
        for long in long_index..index {
            if !self.directory[long].is_long_name() {
                break;
            }
            self.directory[long].reserved[1] = chksum;
        }

        index
    }

    /// Append the long-name entries for `filename`: UCS-2, 13 code
    /// units per entry, emitted in reverse so the physically first
    /// entry carries the highest sequence number with 0x40 set.
    fn create_long_filename(&mut self, filename: &str) -> usize {
        let long_index = self.directory.len();

        let units: Vec<u16> = filename.encode_utf16().collect();
        let length = units.len() * 2;
        let number_of_entries = (length + 25) / 26;

        let mut buffer = vec![0xFFu8; number_of_entries * 26];
        for (i, unit) in units.iter().enumerate() {
            buffer[2 * i..2 * i + 2].copy_from_slice(&unit.to_le_bytes());
        }
        if length < buffer.len() {
            buffer[length] = 0;
            buffer[length + 1] = 0;
        }

        for i in 0..number_of_entries {
            let entry = self.directory.next();
            entry.attributes = Attributes::new_with_raw_value(ATTR_LONG_NAME);
            entry.reserved[0] = 0;
            entry.begin = 0;
            entry.name[0] = (number_of_entries - i) as u8 | if i == 0 { 0x40 } else { 0 };
        }

        for (i, &byte) in buffer.iter().enumerate() {
            let unit = (i % 26) / 2;
            let position = LFN_MAP[unit] + i % 2;
            let entry_index = long_index + number_of_entries - 1 - i / 26;
            bytemuck::bytes_of_mut(&mut self.directory[entry_index])[position] = byte;
        }

        long_index
    }

    /// Reload attribute bits from the `vvfat_attr.cfg` sidecar.
    /// Paths are accepted absolute or relative to the shadowed root;
    /// unknown lines and unknown paths are ignored.
    pub(crate) fn set_file_attributes(&mut self) -> Result<(), VfatError> {
        let path = self.vvfat_path.join(VVFAT_ATTR);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Ok(());
        };

        for line in content.lines() {
            let Some((raw_path, flags)) = line.split_once(':') else {
                continue;
            };
            let trimmed = raw_path.trim().trim_matches('"');
            if trimmed.is_empty() {
                continue;
            }
            let candidate = Path::new(trimmed);
            let full = if candidate.starts_with(&self.vvfat_path) {
                candidate.to_path_buf()
            } else {
                self.vvfat_path.join(candidate)
            };

            let Some(index) = mapping::find_for_path(&self.mapping, &full) else {
                continue;
            };
            let dir_index = self.mapping[index].dir_index;
            let mut attributes = self.directory[dir_index].attributes.raw_value();
            for flag in flags.trim().chars() {
                match flag {
                    'a' => attributes &= !0x20,
                    'S' => attributes |= 0x04,
                    'H' => attributes |= 0x02,
                    'R' => attributes |= 0x01,
                    _ => {}
                }
            }
            self.directory[dir_index].attributes = Attributes::new_with_raw_value(attributes);
        }
        Ok(())
    }
}

#[test]
fn volume_layout_numbers() {
    let dir = tempfile::TempDir::new().unwrap();
    let vfat = crate::open_test_volume(dir.path());

    // 64x16x63 sectors, FAT16, 4-sector clusters
    assert_eq!(vfat.cluster_size, 2048);
    assert_eq!(vfat.cluster_count, 16072);
    assert_eq!(vfat.sectors_per_fat, 63);
    assert_eq!(vfat.offset_to_fat, 64);
    assert_eq!(vfat.offset_to_root_dir, 64 + 2 * 63);
    assert_eq!(vfat.offset_to_data, 64 + 2 * 63 + 32);

    // root directory padded to its full capacity
    assert_eq!(vfat.directory.len(), 512);
    assert_eq!(vfat.mapping.len(), 1);
    assert_eq!(vfat.mapping[0].begin, 0);
    assert_eq!(vfat.mapping[0].end, 2);
}

#[test]
fn short_name_collisions_mangle() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("A Very Long Name.txt"), b"1").unwrap();
    std::fs::write(dir.path().join("A Very Long Nam2.txt"), b"2").unwrap();
    std::fs::write(dir.path().join("ab.txt"), b"3").unwrap();
    std::fs::write(dir.path().join("AB.txt"), b"4").unwrap();
    let vfat = crate::open_test_volume(dir.path());

    let shorts: Vec<[u8; 8]> = vfat
        .directory
        .iter()
        .skip(1)
        .filter(|entry| !entry.is_long_name() && entry.name[0] != 0)
        .map(|entry| entry.name)
        .collect();
    assert_eq!(shorts.len(), 4);

    // one of each colliding pair keeps its plain short name, the
    // other is mangled
    assert_eq!(
        shorts.iter().filter(|name| &name[..] == b"AVERYLON").count(),
        1
    );
    assert_eq!(
        shorts.iter().filter(|name| &name[..] == b"AVERYLO0").count(),
        1
    );
    assert_eq!(shorts.iter().filter(|name| &name[..] == b"AB      ").count(), 1);
    assert_eq!(shorts.iter().filter(|name| &name[..] == b"AB~~~~~0").count(), 1);
}

#[test]
fn forbidden_characters_become_underscores() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("we+ird;na=me.t't"), b"x").unwrap();
    let vfat = crate::open_test_volume(dir.path());

    let entry = vfat
        .directory
        .iter()
        .find(|entry| !entry.is_long_name() && entry.name[0] == b'W')
        .unwrap();
    assert_eq!(&entry.name, b"WE_IRD_N");
    assert_eq!(&entry.extension, b"T_T");
}

#[test]
fn root_directory_overflow_is_lenient() {
    let dir = tempfile::TempDir::new().unwrap();
    for i in 0..140 {
        std::fs::write(dir.path().join(format!("file{i:03}.txt")), b"x").unwrap();
    }
    // a floppy root holds 224 entries; the label plus two entries per
    // file fills it after 111 files
    let vfat = crate::VirtualFatBlockDevice::open(dir.path(), 1_474_560, None).unwrap();
    assert_eq!(vfat.root_entries_dropped(), 29);
    assert_eq!(vfat.mapping.len(), 1 + 111);
    assert_eq!(vfat.directory.len(), 224);
}
