//! Topic naming conventions for the bus.
//!
//! Topics are flat strings: `user_{id}`, `conv_{uuid}`, `call_{uuid}`.

use uuid::Uuid;

#[must_use]
pub fn user(user_id: i64) -> String {
    format!("user_{user_id}")
}

#[must_use]
pub fn conversation(conversation_id: Uuid) -> String {
    format!("conv_{conversation_id}")
}

#[must_use]
pub fn call(call_id: Uuid) -> String {
    format!("call_{call_id}")
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_stable() {
        let id = Uuid::parse_str("6a1f0d62-58f1-4c07-9176-5ba4f47f1e0b").unwrap();
        assert_eq!(user(42), "user_42");
        assert_eq!(conversation(id), format!("conv_{id}"));
        assert_eq!(call(id), format!("call_{id}"));
    }
}
