#![allow(dead_code)]

use std::io::{Cursor, Write};

use repo_courier::contract::{RepositoryMetadata, Visibility};
use repo_courier::tree::FileTree;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Builds a ZIP archive in memory. Names ending in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add directory");
        } else {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(content).expect("write entry");
        }
    }
    writer.finish().expect("finish archive").into_inner()
}

/// Builds a ZIP archive in memory with explicit Unix permissions per file.
pub fn zip_bytes_with_modes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content, mode) in entries {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(*mode);
        writer.start_file(*name, options).expect("start file");
        writer.write_all(content).expect("write entry");
    }
    writer.finish().expect("finish archive").into_inner()
}

pub fn tree_of(entries: &[(&str, &[u8])]) -> FileTree {
    let mut tree = FileTree::new();
    for (path, content) in entries {
        tree.insert(path.to_string(), content.to_vec())
            .expect("distinct paths");
    }
    tree
}

pub fn metadata(name: &str, visibility: Visibility) -> RepositoryMetadata {
    RepositoryMetadata {
        name: name.to_string(),
        url: format!("https://github.com/octo/{name}"),
        visibility,
        default_branch: "main".to_string(),
        description: None,
        language: None,
        stars: 0,
        forks: 0,
        watchers: 0,
        size_kb: 0,
        updated_at: None,
    }
}
