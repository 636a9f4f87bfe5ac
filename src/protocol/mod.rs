pub mod deserializer;
pub mod message;
pub mod serializer;

// no agency ever needs to send a frame this big
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
