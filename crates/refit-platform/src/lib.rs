mod paths;

pub use paths::{AppPaths, AppPathsError, default_install_root};
