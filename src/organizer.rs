//! Destination layout and placement of converted volumes.
//!
//! ```text
//! out_dir/
//! ├── 100123/                      default layout
//! │   └── 100123_5_t1_vibe.nii.gz  (--id prefix)
//! ├── 100124/                      --dixon
//! │   ├── fat/fat.nii.gz
//! │   ├── water/water.nii.gz
//! │   ├── in/in.nii.gz
//! │   └── opp/opp.nii.gz
//! └── 100125_fat.nii.gz            --singledir (prefix always added)
//! ```

use crate::dixon::Channel;
use crate::error::{UnitError, UnitResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// How converted volumes are arranged below the output root.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutOptions {
    /// Prefix file names with the subject identifier.
    pub add_id: bool,
    /// Put every volume directly in the output root.
    pub single_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DestinationLayout {
    root: PathBuf,
    options: LayoutOptions,
}

/// `.nii.gz`, `.nii`, or the plain extension of any other file.
pub fn volume_extension(path: &Path) -> String {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    if name.ends_with(".nii.gz") {
        ".nii.gz".to_string()
    } else {
        path.extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

impl DestinationLayout {
    pub fn new(root: impl Into<PathBuf>, options: LayoutOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a volume goes to. Without a subject the layout is flat.
    pub fn target_dir(&self, subject: Option<&str>, channel: Option<Channel>) -> PathBuf {
        match subject {
            Some(id) if !self.options.single_dir => {
                let dir = self.root.join(id);
                match channel {
                    Some(c) => dir.join(c.label()),
                    None => dir,
                }
            }
            _ => self.root.clone(),
        }
    }

    /// File name of a volume: the channel label for Dixon volumes, otherwise the
    /// converter's name, prefixed with `<id>_` when requested or when flat.
    pub fn target_name(
        &self,
        subject: Option<&str>,
        channel: Option<Channel>,
        volume: &Path,
    ) -> UnitResult<String> {
        let base = match channel {
            Some(c) => format!("{}{}", c.label(), volume_extension(volume)),
            None => volume
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    UnitError::Filesystem(format!("{} has no file name", volume.display()))
                })?,
        };
        let prefix = match subject {
            Some(id) if self.options.add_id || self.options.single_dir => format!("{}_", id),
            _ => String::new(),
        };
        Ok(format!("{}{}", prefix, base))
    }

    pub fn destination(
        &self,
        subject: Option<&str>,
        channel: Option<Channel>,
        volume: &Path,
    ) -> UnitResult<PathBuf> {
        Ok(self
            .target_dir(subject, channel)
            .join(self.target_name(subject, channel, volume)?))
    }
}

/// Moves volumes into a [`DestinationLayout`] and remembers what it changed so
/// that a failed unit can be undone.
pub struct Placement<'a> {
    layout: &'a DestinationLayout,
    created_dirs: Vec<PathBuf>,
    placed: Vec<PathBuf>,
}

impl<'a> Placement<'a> {
    pub fn new(layout: &'a DestinationLayout) -> Self {
        Self {
            layout,
            created_dirs: Vec::new(),
            placed: Vec::new(),
        }
    }

    /// Moves `volume` to its canonical destination and returns that path.
    ///
    /// Missing directories are created; a directory created concurrently by
    /// another unit is fine. An existing file at the destination is never replaced.
    pub async fn place(
        &mut self,
        volume: &Path,
        subject: Option<&str>,
        channel: Option<Channel>,
    ) -> UnitResult<PathBuf> {
        let dest = self.layout.destination(subject, channel, volume)?;
        self.reserve(&dest).await?;
        move_file(volume, &dest).await?;
        debug!("placed {}", dest.display());
        Ok(dest)
    }

    /// Claims `dest` by creating it empty, so that no other unit can take the same name.
    ///
    /// The parent directories are created first. If they vanish before the claim
    /// (another unit rolled back a directory it created), they are created once more.
    async fn reserve(&mut self, dest: &Path) -> UnitResult<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new(""));
        let mut retried = false;
        loop {
            self.ensure_dir(parent).await?;
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dest)
                .await
            {
                Ok(_) => {
                    self.placed.push(dest.to_path_buf());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(UnitError::Filesystem(format!(
                        "{} already exists",
                        dest.display()
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && !retried => {
                    debug!("{} disappeared, creating it again", parent.display());
                    retried = true;
                }
                Err(e) => return Err(UnitError::fs("create", dest, e)),
            }
        }
    }

    async fn ensure_dir(&mut self, dir: &Path) -> UnitResult<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(d) = current {
            if fs::try_exists(d).await.unwrap_or(false) {
                break;
            }
            missing.push(d.to_path_buf());
            current = d.parent();
        }

        for d in missing.into_iter().rev() {
            match fs::create_dir(&d).await {
                Ok(()) => self.created_dirs.push(d),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(UnitError::fs("create", &d, e)),
            }
        }
        Ok(())
    }

    /// Paths placed so far, keeping them in the destination.
    pub fn commit(self) -> Vec<PathBuf> {
        self.placed
    }

    /// Removes the files placed and directories created by this placement.
    pub async fn rollback(self) {
        for file in self.placed.iter().rev() {
            match fs::remove_file(file).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("rollback: cannot remove {}: {}", file.display(), e),
            }
        }
        for dir in self.created_dirs.iter().rev() {
            // only empty directories; another unit may have written into them
            let _ = fs::remove_dir(dir).await;
        }
    }
}

/// Renames `src` to `dest`, copying across filesystems when a rename is not possible.
/// An existing `dest` is replaced.
pub async fn move_file(src: &Path, dest: &Path) -> UnitResult<()> {
    if fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    if let Err(e) = fs::copy(src, dest).await {
        let _ = fs::remove_file(dest).await;
        return Err(UnitError::fs("copy to", dest, e));
    }
    fs::remove_file(src)
        .await
        .map_err(|e| UnitError::fs("remove", src, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path, add_id: bool, single_dir: bool) -> DestinationLayout {
        DestinationLayout::new(root, LayoutOptions { add_id, single_dir })
    }

    #[test]
    fn destinations_follow_layout_options() {
        let root = Path::new("/out");
        let vol = Path::new("/tmp/w/5_t1_vibe.nii.gz");

        assert_eq!(
            layout(root, false, false).destination(Some("100123"), None, vol).unwrap(),
            PathBuf::from("/out/100123/5_t1_vibe.nii.gz")
        );
        assert_eq!(
            layout(root, true, false).destination(Some("100123"), None, vol).unwrap(),
            PathBuf::from("/out/100123/100123_5_t1_vibe.nii.gz")
        );
        assert_eq!(
            layout(root, false, true).destination(Some("100123"), None, vol).unwrap(),
            PathBuf::from("/out/100123_5_t1_vibe.nii.gz")
        );
        assert_eq!(
            layout(root, true, false)
                .destination(Some("100123"), Some(Channel::OpposedPhase), vol)
                .unwrap(),
            PathBuf::from("/out/100123/opp/100123_opp.nii.gz")
        );
        assert_eq!(
            layout(root, false, true)
                .destination(Some("100123"), Some(Channel::Fat), Path::new("x.nii"))
                .unwrap(),
            PathBuf::from("/out/100123_fat.nii")
        );
        assert_eq!(
            layout(root, false, true).destination(None, Some(Channel::Water), vol).unwrap(),
            PathBuf::from("/out/water.nii.gz")
        );
    }

    #[tokio::test]
    async fn placing_twice_for_same_subject_keeps_earlier_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let layout = layout(&out, false, false);

        let first = tmp.path().join("3_t1.nii.gz");
        std::fs::write(&first, b"t1").unwrap();
        let mut placement = Placement::new(&layout);
        let a = placement.place(&first, Some("100123"), None).await.unwrap();
        placement.commit();

        let second = tmp.path().join("4_t2.nii.gz");
        std::fs::write(&second, b"t2").unwrap();
        let mut placement = Placement::new(&layout);
        let b = placement.place(&second, Some("100123"), None).await.unwrap();
        placement.commit();

        assert_eq!(std::fs::read(a).unwrap(), b"t1");
        assert_eq!(std::fs::read(b).unwrap(), b"t2");
        assert!(!first.exists());
    }

    #[tokio::test]
    async fn existing_destination_file_is_not_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), false, true);
        std::fs::write(tmp.path().join("100123_fat.nii.gz"), b"old").unwrap();

        let vol = tmp.path().join("fat.nii.gz");
        std::fs::write(&vol, b"new").unwrap();
        let mut placement = Placement::new(&layout);
        let err = placement
            .place(&vol, Some("100123"), Some(Channel::Fat))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Filesystem");
        assert_eq!(std::fs::read(tmp.path().join("100123_fat.nii.gz")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn rollback_removes_only_what_was_created() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(out.join("100123")).unwrap();
        std::fs::write(out.join("100123").join("earlier.nii.gz"), b"keep").unwrap();
        let layout = layout(&out, false, false);

        let vol = tmp.path().join("fat.nii.gz");
        std::fs::write(&vol, b"x").unwrap();
        let mut placement = Placement::new(&layout);
        let placed = placement
            .place(&vol, Some("100123"), Some(Channel::Fat))
            .await
            .unwrap();
        assert!(placed.exists());

        placement.rollback().await;
        assert!(!placed.exists());
        assert!(!out.join("100123").join("fat").exists());
        assert!(out.join("100123").join("earlier.nii.gz").exists());
    }

    #[tokio::test]
    async fn directory_removed_by_another_unit_is_created_again() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let layout = layout(&out, false, false);
        let mut placement = Placement::new(&layout);

        placement.ensure_dir(&out.join("100123")).await.unwrap();
        std::fs::remove_dir(out.join("100123")).unwrap();

        let dest = out.join("100123").join("t1.nii.gz");
        placement.reserve(&dest).await.unwrap();
        assert!(dest.exists());
        assert!(placement.created_dirs.contains(&out.join("100123")));
    }

    #[tokio::test]
    async fn rollback_of_one_unit_keeps_a_shared_subject_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let layout = layout(&out, false, false);

        let a_vol = tmp.path().join("3_t1.nii.gz");
        let b_vol = tmp.path().join("4_t2.nii.gz");
        std::fs::write(&a_vol, b"a").unwrap();
        std::fs::write(&b_vol, b"b").unwrap();

        let mut a = Placement::new(&layout);
        a.place(&a_vol, Some("100123"), None).await.unwrap();
        let mut b = Placement::new(&layout);
        let kept = b.place(&b_vol, Some("100123"), None).await.unwrap();
        assert!(b.created_dirs.is_empty());

        a.rollback().await;
        assert_eq!(std::fs::read(&kept).unwrap(), b"b");
        assert_eq!(b.commit(), vec![kept]);
    }
}
