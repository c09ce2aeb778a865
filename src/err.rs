pub use usb_if::err::{LowLevelError, UsbdError};

pub type Result<T = ()> = core::result::Result<T, UsbdError>;
