//! Fixtures shared by the unit tests of the workspace crates

use std::path::Path;

/// Creates the tree used throughout the tests:
///
/// ```text
/// a/
///   b/c.txt
///   d.txt
/// f1            (10 x 'A')
/// f2            hard link of f1
/// link -> a/d.txt
/// x/q.txt
/// y/z.txt
/// ```
pub fn sample_tree() -> anyhow::Result<tempfile::TempDir> {
    let tmp = tempfile::tempdir()?;
    populate(tmp.path())?;
    Ok(tmp)
}

pub fn populate(root: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(root.join("a/b"))?;
    std::fs::write(root.join("a/b/c.txt"), "c")?;
    std::fs::write(root.join("a/d.txt"), "d contents")?;
    std::fs::write(root.join("f1"), "A".repeat(10))?;
    std::fs::hard_link(root.join("f1"), root.join("f2"))?;
    std::os::unix::fs::symlink("a/d.txt", root.join("link"))?;
    std::fs::create_dir(root.join("x"))?;
    std::fs::write(root.join("x/q.txt"), "q")?;
    std::fs::create_dir(root.join("y"))?;
    std::fs::write(root.join("y/z.txt"), "z")?;
    Ok(())
}
