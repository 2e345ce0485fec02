//! Commit engine: walks the redo-log-modified volume, diffs it
//! against the mapping table and mutates the shadowed directory to
//! match what the guest left behind.

use std::fs::{self, File, OpenOptions};
use std::io::{SeekFrom, Write};
use std::path::Path;

use log::warn;

use crate::direntry::{decode_fat_datetime, DirEntry, DIRENTRY_SIZE, LFN_MAP};
use crate::fat_region::{self, FatType};
use crate::mapping;
use crate::{VfatError, VirtualFatBlockDevice, VVFAT_ATTR};

/// Scan `buffer` from `*pos` for the next short-name entry,
/// reconstructing the long filename from any preceding long-name
/// entries (falling back to the lowercased 8.3 name). Free, deleted,
/// dot and volume-label entries are skipped. `None` at the
/// end-of-directory terminator or the end of the buffer.
fn read_direntry(buffer: &[u8], pos: &mut usize, filename: &mut String) -> Option<DirEntry> {
    let mut long_name: Vec<u8> = Vec::new();
    let mut has_lfn = false;
    filename.clear();

    loop {
        if *pos + DIRENTRY_SIZE > buffer.len() {
            return None;
        }
        let mut entry: DirEntry = bytemuck::pod_read_unaligned(&buffer[*pos..*pos + DIRENTRY_SIZE]);
        if entry.name[0] == 0 {
            return None;
        }
        if entry.name[0] == b'.'
            || entry.name[0] == 0xE5
            || entry.attributes.raw_value() & 0x0F == 0x08
        {
            *pos += DIRENTRY_SIZE;
            continue;
        }

        if entry.is_long_name() {
            let chunk = &buffer[*pos..*pos + DIRENTRY_SIZE];
            let fragment: Vec<u8> = LFN_MAP
                .iter()
                .map(|&offset| chunk[offset])
                .take_while(|&byte| byte != 0)
                .collect();
            // entries are stored in reverse order
            long_name.splice(0..0, fragment);
            has_lfn = true;
            *pos += DIRENTRY_SIZE;
            continue;
        }

        if has_lfn {
            *filename = String::from_utf8_lossy(&long_name).into_owned();
        } else {
            if entry.name[0] == 0x05 {
                entry.name[0] = 0xE5;
            }
            let mut bytes: Vec<u8> = entry.name.to_vec();
            while bytes.last() == Some(&b' ') {
                bytes.pop();
            }
            if entry.extension[0] != b' ' {
                bytes.push(b'.');
                bytes.extend_from_slice(&entry.extension);
                while bytes.last() == Some(&b' ') {
                    bytes.pop();
                }
            }
            for byte in bytes.iter_mut() {
                byte.make_ascii_lowercase();
            }
            *filename = String::from_utf8_lossy(&bytes).into_owned();
        }
        *pos += DIRENTRY_SIZE;
        return Some(entry);
    }
}

impl VirtualFatBlockDevice {
    /// Reconcile the shadowed directory with the guest's view of the
    /// volume. The live (redo-log-overlaid) FAT and directory tree
    /// are the source of truth; host files are created, rewritten,
    /// renamed and deleted to match, and the attribute sidecar is
    /// rewritten from scratch.
    pub fn commit_changes(&mut self) -> Result<(), VfatError> {
        // read the modified FAT back through the I/O stack so the
        // redo-log overlay is visible
        let fat_bytes = self.sectors_per_fat as usize * 0x200;
        let mut fat2 = vec![0u8; fat_bytes];
        self.lseek(SeekFrom::Start(u64::from(self.offset_to_fat) * 0x200))?;
        self.read(&mut fat2)?;
        self.fat2 = fat2;

        // mark all mapped directories and files for deletion; the
        // walk clears the mark on everything it still reaches
        for mapping in self.mapping.iter_mut().skip(1) {
            mapping.deleted = true;
        }

        let attr_path = self.vvfat_path.join(VVFAT_ATTR);
        let mut attr_out = File::create(&attr_path).ok();

        let root_path = self.vvfat_path.clone();
        let root_cluster = match self.fat_type {
            FatType::Fat32 => self.first_cluster_of_root_dir,
            _ => 0,
        };
        self.parse_directory(&root_path, root_cluster, &mut attr_out)?;
        drop(attr_out);

        // remove everything still marked, children before parents
        for index in (1..self.mapping.len()).rev() {
            if !self.mapping[index].deleted {
                continue;
            }
            let path = self.mapping[index].path.clone();
            let entry = self.directory[self.mapping[index].dir_index];
            let result = if entry.attributes.raw_value() == 0x10 {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(error) = result {
                warn!("could not remove '{}': {error}", path.display());
            }
        }

        self.fat2 = Vec::new();
        Ok(())
    }

    /// Next cluster after `current` in the read-back FAT.
    fn fat_get_next(&self, current: u32) -> u32 {
        fat_region::entry(&self.fat2, self.fat_type, current)
    }

    /// Walk one directory of the modified volume and reconcile each
    /// entry against the mapping table.
    fn parse_directory(
        &mut self,
        path: &Path,
        start_cluster: u32,
        attr_out: &mut Option<File>,
    ) -> Result<(), VfatError> {
        let csize = self.cluster_size as usize;
        let rsvd_clusters = self.max_fat_value - 15;

        let mut buffer: Vec<u8>;
        if start_cluster == 0 {
            // FAT12/16 root directory region
            buffer = vec![0; usize::from(self.root_entries) * DIRENTRY_SIZE];
            self.lseek(SeekFrom::Start(u64::from(self.offset_to_root_dir) * 0x200))?;
            self.read(&mut buffer)?;
        } else {
            buffer = Vec::new();
            let mut next = start_cluster;
            let mut walked = 0u32;
            loop {
                let current = next;
                let sector = self.cluster_to_sector(current);
                let start = buffer.len();
                buffer.resize(start + csize, 0);
                self.lseek(SeekFrom::Start(u64::from(sector) * 0x200))?;
                self.read(&mut buffer[start..])?;
                next = self.fat_get_next(current);
                walked += 1;
                if next >= rsvd_clusters || walked > self.cluster_count {
                    break;
                }
            }
        }

        let mut pos = 0;
        let mut filename = String::new();
        while let Some(newentry) = read_direntry(&buffer, &mut pos, &mut filename) {
            let full_path = path.join(&filename);
            let attributes = newentry.attributes.raw_value();

            if attributes != 0x10 && attributes != 0x20 {
                if let Some(out) = attr_out.as_mut() {
                    let mut flags = String::new();
                    if attributes & 0x30 == 0 {
                        flags.push('a');
                    }
                    if attributes & 0x04 != 0 {
                        flags.push('S');
                    }
                    if attributes & 0x02 != 0 {
                        flags.push('H');
                    }
                    if attributes & 0x01 != 0 {
                        flags.push('R');
                    }
                    let rel = full_path
                        .strip_prefix(&self.vvfat_path)
                        .unwrap_or(&full_path);
                    let _ = writeln!(out, "\"{}\":{}", rel.display(), flags);
                }
            }

            let fstart = newentry.start_cluster();
            match mapping::find_for_cluster(&self.mapping, fstart) {
                None => {
                    // a guest-created object
                    if attributes & 0x10 != 0 {
                        let _ = fs::create_dir(&full_path);
                        self.parse_directory(&full_path, fstart, attr_out)?;
                    } else if full_path.exists() {
                        if let Some(index) = mapping::find_for_path(&self.mapping, &full_path) {
                            self.mapping[index].deleted = false;
                        }
                        self.write_file(&full_path, &newentry, false)?;
                    } else {
                        self.write_file(&full_path, &newentry, true)?;
                    }
                }
                Some(index) => {
                    let entry = self.directory[self.mapping[index].dir_index];
                    let mapping_path = self.mapping[index].path.clone();
                    let changed = { newentry.mdate } != { entry.mdate }
                        || { newentry.mtime } != { entry.mtime }
                        || { newentry.size } != { entry.size };

                    if full_path == mapping_path {
                        if attributes & 0x10 != 0 {
                            self.parse_directory(&full_path, fstart, attr_out)?;
                        } else if changed {
                            self.write_file(&full_path, &newentry, false)?;
                        }
                        self.mapping[index].deleted = false;
                    } else if { newentry.cdate } == { entry.cdate }
                        && { newentry.ctime } == { entry.ctime }
                    {
                        // same creation stamp: the guest renamed it
                        if let Err(error) = fs::rename(&mapping_path, &full_path) {
                            warn!(
                                "could not rename '{}' to '{}': {error}",
                                mapping_path.display(),
                                full_path.display()
                            );
                        }
                        if attributes & 0x10 != 0 {
                            self.parse_directory(&full_path, fstart, attr_out)?;
                        } else if changed {
                            self.write_file(&full_path, &newentry, false)?;
                        }
                        self.mapping[index].deleted = false;
                    } else {
                        // a new object reusing the clusters
                        if attributes & 0x10 != 0 {
                            let _ = fs::create_dir(&full_path);
                            self.parse_directory(&full_path, fstart, attr_out)?;
                        } else if full_path.exists() {
                            if let Some(other) =
                                mapping::find_for_path(&self.mapping, &full_path)
                            {
                                self.mapping[other].deleted = false;
                            }
                            self.write_file(&full_path, &newentry, false)?;
                        } else {
                            self.write_file(&full_path, &newentry, true)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Create or truncate the host file and fill it from the entry's
    /// cluster chain, then apply the entry's timestamps.
    fn write_file(&mut self, path: &Path, entry: &DirEntry, create: bool) -> Result<(), VfatError> {
        let csize = self.cluster_size as usize;
        let rsvd_clusters = self.max_fat_value - 15;
        let bad_cluster = self.max_fat_value - 8;
        let mut fsize = { entry.size } as usize;
        let fstart = entry.start_cluster();

        let open = if create {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        } else {
            OpenOptions::new().write(true).truncate(true).open(path)
        };
        let mut file = match open {
            Ok(file) => file,
            Err(error) => {
                warn!("could not write '{}': {error}", path.display());
                return Ok(());
            }
        };

        if fstart >= 2 && fsize > 0 {
            let mut buffer = vec![0u8; csize];
            let mut next = fstart;
            let mut walked = 0u32;
            loop {
                let current = next;
                let sector = self.cluster_to_sector(current);
                self.lseek(SeekFrom::Start(u64::from(sector) * 0x200))?;
                self.read(&mut buffer)?;
                let take = fsize.min(csize);
                file.write_all(&buffer[..take])?;
                fsize -= take;

                next = self.fat_get_next(current);
                if next >= rsvd_clusters && next < bad_cluster {
                    warn!("reserved clusters not supported");
                }
                walked += 1;
                if next >= rsvd_clusters || walked > self.cluster_count {
                    break;
                }
            }
        }

        let modified = decode_fat_datetime({ entry.mdate }, { entry.mtime });
        let accessed = if { entry.adate } != 0 {
            decode_fat_datetime({ entry.adate }, 0)
        } else {
            modified
        };
        if let Some(modified) = modified {
            let times = fs::FileTimes::new()
                .set_modified(modified)
                .set_accessed(accessed.unwrap_or(modified));
            if let Err(error) = file.set_times(times) {
                warn!("could not set times on '{}': {error}", path.display());
            }
        }
        Ok(())
    }
}

#[test]
fn direntry_scan_skips_noise_and_lowercases() {
    let mut buffer = [0u8; 4 * DIRENTRY_SIZE];
    // a deleted entry
    buffer[0] = 0xE5;
    // a volume label
    buffer[32..40].copy_from_slice(b"SOMEDISK");
    buffer[32 + 11] = 0x28;
    // a plain short-name entry
    buffer[64..72].copy_from_slice(b"README  ");
    buffer[72..75].copy_from_slice(b"MD ");
    buffer[64 + 11] = 0x20;
    // terminator stays zero

    let mut pos = 0;
    let mut filename = String::new();
    let entry = read_direntry(&buffer, &mut pos, &mut filename).unwrap();
    assert_eq!(filename, "readme.md");
    assert_eq!(&entry.name, b"README  ");
    assert_eq!(pos, 96);

    assert!(read_direntry(&buffer, &mut pos, &mut filename).is_none());
}

#[test]
fn direntry_scan_reconstructs_long_names() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("A Very Long Name.txt"), b"x").unwrap();
    let mut vfat = crate::open_test_volume(dir.path());

    let mut buffer = vec![0u8; usize::from(vfat.root_entries) * DIRENTRY_SIZE];
    vfat.lseek(SeekFrom::Start(u64::from(vfat.offset_to_root_dir) * 0x200))
        .unwrap();
    vfat.read(&mut buffer).unwrap();

    let mut pos = 0;
    let mut filename = String::new();
    let entry = read_direntry(&buffer, &mut pos, &mut filename).unwrap();
    assert_eq!(filename, "A Very Long Name.txt");
    assert_eq!(&entry.name, b"AVERYLON");
}

#[test]
fn attribute_sidecar_round_trips_through_commit() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"abc").unwrap();
    std::fs::write(dir.path().join(VVFAT_ATTR), "\"hello.txt\":HR\n").unwrap();

    let mut vfat = crate::open_test_volume(dir.path());
    vfat.commit_changes().unwrap();

    let rewritten = std::fs::read_to_string(dir.path().join(VVFAT_ATTR)).unwrap();
    assert_eq!(rewritten, "\"hello.txt\":HR\n");
    // nothing was rewritten on disk
    assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"abc");
}
