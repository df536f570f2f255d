pub mod files;
pub mod text;

pub use files::*;
pub use text::*;
