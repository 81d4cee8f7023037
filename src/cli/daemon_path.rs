use std::path::PathBuf;

use crate::utils::dir::APPLICATION_NAME;

/// Path of the daemon binary installed next to the cli at `path`.
pub fn to_daemon_path(mut path: PathBuf) -> PathBuf {
    path.set_file_name(format!("{APPLICATION_NAME}-daemon"));
    #[cfg(windows)]
    {
        path.set_extension("exe");
    }
    path
}
