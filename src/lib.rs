// Library module declarations
pub mod value;
pub mod error;
pub mod registry;
pub mod metaclass;
pub mod field;
pub mod enumerator;
pub mod template;
pub mod resolver;
pub mod protocol;
pub mod work;
pub mod entity;
pub mod packet;
pub mod interception;
pub mod cipher;
pub mod framing;
pub mod packet_logger;
pub mod hiding;
pub mod replay;
pub mod config;
pub mod session;
pub mod proxy;

pub use enumerator::{DecodedPacket, Enumerator, ReadOptions, ScriptNode};
pub use field::{FieldElement, FieldKind};
pub use interception::{InterceptContext, InterceptionPipeline, PacketInterceptor, PacketListener, PacketOutcome};
pub use packet::{EndpointType, Injection, Packet};
pub use packet_logger::{PacketEntry, PacketLog, PacketLogger};
pub use registry::{MetaclassRegistry, SharedRegistry};
pub use resolver::PrefixResolver;
pub use template::{PacketTemplate, ProtocolVersion};
