pub mod marks;

pub use marks::{join_marks, AddressMark, MarkStore, MemoryMarkStore, RedisMarkStore, SessionMark};
