//! Fixed bus subjects and broadcast topics.
//!
//! There is exactly one subject and one topic per message kind. The strings
//! are part of the external contract and must not change.

/// Bus subject carrying chat messages.
pub const CHAT_SUBJECT: &str = "chat.messages";

/// Bus subject carrying notifications.
pub const NOTIFICATION_SUBJECT: &str = "notifications";

/// Bus subject carrying tasks awaiting processing.
pub const TASK_SUBJECT: &str = "tasks.process";

/// Broadcast topic for chat messages.
pub const CHAT_TOPIC: &str = "/topic/chat";

/// Broadcast topic for notifications.
pub const NOTIFICATION_TOPIC: &str = "/topic/notifications";

/// Broadcast topic for processed tasks.
pub const TASK_TOPIC: &str = "/topic/tasks";

/// All bus subjects, in pipeline order.
pub const ALL_SUBJECTS: [&str; 3] = [CHAT_SUBJECT, NOTIFICATION_SUBJECT, TASK_SUBJECT];

/// All broadcast topics, in pipeline order.
pub const ALL_TOPICS: [&str; 3] = [CHAT_TOPIC, NOTIFICATION_TOPIC, TASK_TOPIC];

/// Check whether a name is one of the fixed broadcast topics.
#[must_use]
pub fn is_topic(name: &str) -> bool {
    ALL_TOPICS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_are_distinct_from_subjects() {
        for topic in ALL_TOPICS {
            assert!(is_topic(topic));
            assert!(!ALL_SUBJECTS.contains(&topic));
        }
        assert!(!is_topic("chat.messages"));
        assert!(!is_topic("/topic/unknown"));
    }
}
