use uuid::Uuid;

/// Source of server-side identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> String;
    fn generate_request_id(&self) -> String;
    fn generate_conversation_id(&self) -> String;
}

/// Time-ordered UUIDv7 ids with a type prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate_message_id(&self) -> String {
        format!("msg_{}", Uuid::now_v7().simple())
    }

    fn generate_request_id(&self) -> String {
        format!("req_{}", Uuid::now_v7().simple())
    }

    fn generate_conversation_id(&self) -> String {
        format!("conv_{}", Uuid::now_v7().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_distinct() {
        let ids = UuidIdGenerator;
        let a = ids.generate_message_id();
        let b = ids.generate_message_id();
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
        assert!(ids.generate_request_id().starts_with("req_"));
        assert!(ids.generate_conversation_id().starts_with("conv_"));
    }
}
