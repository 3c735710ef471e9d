//! syde-core - System definition and view model for the openSYDE diagnostic driver
//!
//! This crate holds the passive structures shared by every layer of the
//! driver: nodes with their data pools, lists and elements, the typed
//! [`Content`] values stored in them, CAN message layouts, and the view
//! configuration that selects which nodes and elements take part in a
//! diagnostic session.
//!
//! Nothing in here performs I/O towards a device. Values are mutated in place
//! by the driver while a session is running.

pub mod can;
pub mod content;
pub mod error;
pub mod ids;
pub mod node;
pub mod system;
pub mod view;

pub use can::{CanMessage, CanSignal, MuxType};
pub use content::{ByteOrder, Content};
pub use error::{CoreError, CoreResult};
pub use ids::{ElementId, ListId};
pub use node::{
    DataPool, DataPoolType, DiagnosticServer, Element, Interface, InterfaceKind, List, Node,
    ServerAddress,
};
pub use system::{BusConfig, SharedNode, SystemConfig, SystemDefinition};
pub use view::{
    ReadRailAssignment, RouteConfig, RouteHop, TransmissionMode, UpdateRates, ViewConfig,
};
