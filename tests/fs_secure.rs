use std::{fs, os::unix::fs::PermissionsExt};

use credible::fs_secure::{
    create_exclusive_file, create_missing_dirs, remove_created_dirs, secure_delete_file,
    write_private_file_atomic, READ_ONLY_FILE_MODE,
};

fn mode_of(path: &std::path::Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn write_private_file_atomic_overwrites() {
    let temp_dir = tempfile::tempdir().unwrap();
    let file_path = temp_dir.path().join("nested/data.bin");

    write_private_file_atomic(&file_path, b"one").unwrap();
    write_private_file_atomic(&file_path, b"two").unwrap();

    assert_eq!(fs::read(&file_path).unwrap(), b"two");
    assert_eq!(mode_of(&file_path), 0o600);
}

#[test]
fn create_exclusive_file_never_overwrites() {
    let temp_dir = tempfile::tempdir().unwrap();
    let file_path = temp_dir.path().join("secret.txt");

    create_exclusive_file(&file_path, b"one", READ_ONLY_FILE_MODE).unwrap();
    let error = create_exclusive_file(&file_path, b"two", READ_ONLY_FILE_MODE).unwrap_err();

    assert_eq!(error.kind(), std::io::ErrorKind::AlreadyExists);
    assert_eq!(fs::read(&file_path).unwrap(), b"one");
    assert_eq!(mode_of(&file_path), 0o400);
}

#[test]
fn created_dirs_are_removed_innermost_first() {
    let temp_dir = tempfile::tempdir().unwrap();
    let leaf = temp_dir.path().join("a/b/c");

    let created = create_missing_dirs(&leaf).unwrap();
    assert_eq!(
        created,
        [
            temp_dir.path().join("a"),
            temp_dir.path().join("a/b"),
            temp_dir.path().join("a/b/c"),
        ]
    );
    assert!(leaf.is_dir());

    remove_created_dirs(&created);
    assert!(!temp_dir.path().join("a").exists());
}

#[test]
fn created_dirs_with_foreign_content_are_kept() {
    let temp_dir = tempfile::tempdir().unwrap();
    let created = create_missing_dirs(&temp_dir.path().join("a/b")).unwrap();
    fs::write(temp_dir.path().join("a/keep.txt"), b"keep").unwrap();

    remove_created_dirs(&created);

    assert!(!temp_dir.path().join("a/b").exists());
    assert!(temp_dir.path().join("a/keep.txt").exists());
}

#[test]
fn secure_delete_removes_read_only_files_and_ignores_missing() {
    let temp_dir = tempfile::tempdir().unwrap();
    let file_path = temp_dir.path().join("secret.txt");
    create_exclusive_file(&file_path, b"hunter2", READ_ONLY_FILE_MODE).unwrap();

    secure_delete_file(&file_path).unwrap();
    assert!(!file_path.exists());
    secure_delete_file(&file_path).unwrap();
}

#[test]
fn secure_delete_refuses_directories() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dir_path = temp_dir.path().join("dir");
    fs::create_dir(&dir_path).unwrap();

    assert!(secure_delete_file(&dir_path).is_err());
    assert!(dir_path.is_dir());
}
