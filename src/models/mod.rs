pub mod audit;
pub mod enums;
pub mod patient;

pub use audit::*;
pub use enums::*;
pub use patient::*;
