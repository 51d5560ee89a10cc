//! Host-side driver for the PICokit PIC18 ICSP programmer.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod partition;
pub mod protocol;
pub mod transport;

pub use self::constants::Layout;
pub use self::device::Chip;
pub use self::error::{Error, Outcome, Result};
pub use self::flashing::{Programmer, VerifyReport};
pub use self::image::MemoryImage;
pub use self::protocol::{Command, Response, Status};
pub use self::transport::Transport;
