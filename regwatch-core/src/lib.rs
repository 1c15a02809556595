//! Selective Modbus holding-register polling.
//!
//! Consumers register the addresses they care about with a [`Coordinator`],
//! which polls only those over a single serialized connection and publishes
//! each cycle as one [`ValueSnapshot`]. Values are decoded on demand from
//! the snapshot according to a [`RegisterDescriptor`]; writes update the
//! snapshot optimistically and are verified by a delayed re-poll.
//!
//! - [`decode`] - Typed decoding/encoding of raw words
//! - [`registry`] - The append-only set of polled addresses
//! - [`transport`] - Serialized, lazily reconnecting device access
//! - [`poller`] - Periodic and on-demand poll cycles
//! - [`store`] - Published snapshots
//! - [`writer`] - Optimistic writes with delayed verification
//! - [`config`] - Connection and timing settings

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod poller;
pub mod registry;
pub mod store;
pub mod transport;
pub mod writer;

pub use config::{ConnectionConfig, CoordinatorSettings};
pub use coordinator::{Coordinator, CoordinatorError};
pub use decode::{
    BitLabel, DEFAULT_INVERSION_FLAG_ADDRESS, DataType, EncodeError, Flag, OptionLabel,
    RegisterDescriptor, TypedValue, decode, decode_bit, encode, encode_inverted,
};
pub use poller::{PollError, PollSummary};
pub use store::ValueSnapshot;
pub use transport::{
    ConnectionState, Connector, ModbusConnector, RegisterLink, Transport, TransportError,
};
