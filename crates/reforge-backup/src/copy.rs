//! Directory tree copying shared by snapshot, restore and apply.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Copy every entry under `src` into `dst`, overwriting files that already
/// exist there. Entries under `exclude` are skipped, unless `exclude`
/// contains `src` itself. Symlinks are recreated, not followed. Returns the
/// number of files copied.
pub fn copy_tree(src: &Path, dst: &Path, exclude: Option<&Path>) -> io::Result<u64> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", src.display()),
        ));
    }
    fs::create_dir_all(dst)?;
    let exclude = exclude.filter(|skip| !src.starts_with(skip));

    let mut copied = 0;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| exclude.is_none_or(|skip| !entry.path().starts_with(skip)));

    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let pointee = fs::read_link(link)?;
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(pointee, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

/// Remove everything inside `dir`, keeping `dir` itself. A missing `dir` is
/// created empty.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return fs::create_dir_all(dir),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn copies_nested_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("VERSION"), "v1\n");
        write(&src.path().join("app/main.py"), "print()");
        write(&src.path().join("app/static/index.html"), "<html/>");

        let copied = copy_tree(src.path(), dst.path(), None).unwrap();

        assert_eq!(copied, 3);
        assert_eq!(
            fs::read_to_string(dst.path().join("app/static/index.html")).unwrap(),
            "<html/>"
        );
    }

    #[test]
    fn overwrites_existing_files_and_keeps_others() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "new");
        write(&dst.path().join("a.txt"), "old");
        write(&dst.path().join("local.cfg"), "keep");

        copy_tree(src.path(), dst.path(), None).unwrap();

        assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.path().join("local.cfg")).unwrap(), "keep");
    }

    #[test]
    fn excluded_subtree_is_skipped() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("keep.txt"), "x");
        write(&src.path().join("backups/old/file"), "y");

        let exclude = src.path().join("backups");
        copy_tree(src.path(), dst.path(), Some(&exclude)).unwrap();

        assert!(dst.path().join("keep.txt").exists());
        assert!(!dst.path().join("backups").exists());
    }

    #[test]
    fn exclude_containing_the_source_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        let src = backups.join("app");
        write(&src.join("main.py"), "v1");
        write(&src.join("lib/util.py"), "u");

        let dst = backups.join(".snapshot.partial");
        let copied = copy_tree(&src, &dst, Some(&backups)).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(dst.join("main.py")).unwrap(), "v1");
    }

    #[test]
    fn missing_source_is_an_error() {
        let dst = tempfile::tempdir().unwrap();
        let err = copy_tree(Path::new("/nonexistent/reforge/src"), dst.path(), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("real.txt"), "r");
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        copy_tree(src.path(), dst.path(), None).unwrap();

        let link = dst.path().join("link.txt");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("real.txt"));
    }

    #[test]
    fn clear_dir_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a/b/c.txt"), "1");
        write(&dir.path().join("top.txt"), "2");

        clear_dir(dir.path()).unwrap();

        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn clear_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fresh");
        clear_dir(&target).unwrap();
        assert!(target.is_dir());
    }
}
