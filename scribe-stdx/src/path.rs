//! Functions for working with [Path].

use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf},
};

use crate::env::current_working_dir;

/// Expands tilde `~` into the user's home directory if available, otherwise
/// returns the path unchanged.
///
/// The tilde is only expanded when it is the whole first component.
pub fn expand_tilde<'a, P>(path: P) -> Cow<'a, Path>
where
    P: Into<Cow<'a, Path>>,
{
    let path = path.into();
    let mut components = path.components();
    if let Some(Component::Normal(c)) = components.next() {
        if c == "~" {
            if let Some(mut buf) = home_dir() {
                buf.push(components);
                return Cow::Owned(buf);
            }
        }
    }

    path
}

fn home_dir() -> Option<PathBuf> {
    #[allow(deprecated)] // correct on the platforms this library targets
    std::env::home_dir()
}

/// Normalize a path without resolving symlinks and without touching the
/// filesystem: `.` components are dropped and `..` components pop their
/// parent.
pub fn normalize(path: impl AsRef<Path>) -> PathBuf {
    let mut components = path.as_ref().components().peekable();
    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().copied() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };

    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => {
                ret.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                ret.pop();
            }
            Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    dunce::simplified(&ret).to_path_buf()
}

/// Returns the absolute form of a path with all intermediate components
/// normalized.
///
/// Unlike [`std::fs::canonicalize`] this does not require the path to exist,
/// which matters for files a workspace is about to create.
pub fn canonicalize(path: impl AsRef<Path>) -> PathBuf {
    let path = expand_tilde(path.as_ref());
    let path = if path.is_relative() {
        Cow::Owned(current_working_dir().join(path))
    } else {
        path
    };

    normalize(path)
}

/// Whether `path` is lexically inside `root`. Both paths should already be
/// canonicalized.
pub fn is_relative_to(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::normalize;

    #[test]
    fn normalizes_dot_components() {
        assert_eq!(
            normalize(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize(Path::new("a/b/./..")), PathBuf::from("a"));
    }

    #[test]
    fn keeps_root() {
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
    }
}
