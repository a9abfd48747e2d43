pub mod firmware;
pub mod loader;
pub mod template;
pub mod types;

pub use firmware::{resolve_and_materialize as resolve_firmware, FirmwarePaths};
pub use loader::{load, load_template_text};
pub use template::render as render_template;
pub use types::{CloudInitConfig, Config, Paths, VmConfig};
