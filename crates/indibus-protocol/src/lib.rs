//! Wire codec and control protocol for indibus.
//!
//! The device/client wire format is a stream of XML elements with no
//! enclosing document and no length prefix:
//!
//! ```text
//! <getProperties version="1.7"/>
//! <defSwitchVector device="Camera" name="EXPOSE" ...>
//!   <defSwitch name="START">Off</defSwitch>
//! </defSwitchVector>
//! ```
//!
//! [`StreamDecoder`] accepts bytes in arbitrary chunks and yields one
//! [`Message`](indibus_core::Message) per complete top-level element,
//! skipping malformed or unknown frames. [`encode_message`] renders the
//! reverse direction. [`FrameReader`] and [`FrameWriter`] wrap both around
//! tokio streams.
//!
//! The [`control`] module holds the administrative protocol spoken over the
//! broker's local control socket.
//!
//! # Example
//!
//! ```rust
//! use indibus_core::{GetProperties, Message};
//! use indibus_protocol::{StreamDecoder, encode_message};
//!
//! let bytes = encode_message(&Message::GetProperties(GetProperties::all())).unwrap();
//! let mut decoder = StreamDecoder::new();
//! decoder.feed(&bytes);
//! assert!(matches!(decoder.next_message(), Some(Ok(Message::GetProperties(_)))));
//! ```

pub mod control;
mod decode;
mod encode;
mod error;
mod scanner;
mod stream;

pub use control::{
    CONTROL_PROTOCOL_VERSION, ControlRequest, ControlResponse, DeviceInfo, DriverKind, DriverSpec,
    Envelope, ErrorCode, ErrorResponse, MAX_CONTROL_MESSAGE_SIZE, StatusInfo, decode_control,
    encode_control, read_control, write_control,
};
pub use decode::{StreamDecoder, parse_frame};
pub use encode::encode_message;
pub use error::{ProtocolError, ProtocolResult};
pub use stream::{FrameReader, FrameWriter};

/// Default wire protocol port.
pub const DEFAULT_PORT: u16 = 7624;

/// Largest frame the decoder buffers before discarding it (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
