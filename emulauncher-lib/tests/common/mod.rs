//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

/// One entry of a hand-built tar stream
pub enum Entry<'a> {
    File { name: &'a str, mode: u32, data: &'a [u8] },
    Dir { name: &'a str },
    Symlink { name: &'a str, target: &'a str },
    HardLink { name: &'a str, target: &'a str },
}

fn header(name: &str, entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    // Names are written raw so traversal attempts reach the extractor unchanged
    let gnu = header.as_gnu_mut().unwrap();
    gnu.name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header
}

fn set_link(header: &mut tar::Header, target: &str) {
    let gnu = header.as_gnu_mut().unwrap();
    gnu.linkname[..target.len()].copy_from_slice(target.as_bytes());
}

pub fn tar_bytes(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        match *entry {
            Entry::File { name, mode, data } => {
                let mut h = header(name, tar::EntryType::Regular, mode, data.len() as u64);
                h.set_cksum();
                builder.append(&h, data).unwrap();
            }
            Entry::Dir { name } => {
                let mut h = header(name, tar::EntryType::Directory, 0o755, 0);
                h.set_cksum();
                builder.append(&h, std::io::empty()).unwrap();
            }
            Entry::Symlink { name, target } => {
                let mut h = header(name, tar::EntryType::Symlink, 0o777, 0);
                set_link(&mut h, target);
                h.set_cksum();
                builder.append(&h, std::io::empty()).unwrap();
            }
            Entry::HardLink { name, target } => {
                let mut h = header(name, tar::EntryType::Link, 0o644, 0);
                set_link(&mut h, target);
                h.set_cksum();
                builder.append(&h, std::io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub fn write_zstd(path: &Path, entries: &[Entry<'_>]) {
    let compressed = zstd::stream::encode_all(&tar_bytes(entries)[..], 3).unwrap();
    std::fs::write(path, compressed).unwrap();
}

pub fn write_xz(path: &Path, entries: &[Entry<'_>]) {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&tar_bytes(entries)).unwrap();
    std::fs::write(path, encoder.finish().unwrap()).unwrap();
}

#[cfg(unix)]
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode()
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
