//! Domain models shared by capture, backfill and queries

pub mod event;
pub mod record;
pub mod queue_model;

pub use event::{
    is_init_event, map_init_event, progress_label, role_label, EventDescriptor, EventType,
    INIT_EVENT_LP, INIT_EVENT_MEM,
};
pub use queue_model::{collection_schema, type_name, MemberData, ObjectData, QueueModel, SchemaKind, UserData};
pub use record::{value_as_bool, value_as_i64, value_as_string, AggregatedRecord, CapturedEvent, Section};
