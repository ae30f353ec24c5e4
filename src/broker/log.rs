use chrono::Utc;
use uuid::Uuid;

use crate::model::{Draft, Message};

/// Append-only, time-ordered record of every message relayed in this process.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps the draft with an id and timestamp when absent and appends it.
    ///
    /// Timestamps never go backwards relative to the previous entry, so append
    /// order and `sent_at` order agree even if the wall clock steps back.
    pub fn append(&mut self, draft: Draft) -> &Message {
        let now = Utc::now();
        let floor = self.messages.last().map(|m| m.sent_at);
        let sent_at = match (draft.sent_at.unwrap_or(now), floor) {
            (at, Some(floor)) if at < floor => floor,
            (at, _) => at,
        };

        self.messages.push(Message {
            id: draft.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            text: draft.text,
            media: draft.media,
            sender_id: draft.sender_id,
            recipient_id: draft.recipient_id,
            sender_role: draft.sender_role,
            sent_at,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    /// Messages exchanged between exactly `a` and `b`, in append order.
    pub fn for_pair<'a>(&'a self, a: &'a str, b: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.iter().filter(move |m| m.is_between(a, b))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn draft(from: &str, to: &str, text: &str) -> Draft {
        Draft {
            text: text.to_owned(),
            sender_id: from.to_owned(),
            recipient_id: to.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn append_preserves_order() {
        let mut log = MessageLog::new();
        for i in 0..20 {
            log.append(draft("user1", "admin1", &i.to_string()));
        }

        let texts: Vec<_> = log.all().iter().map(|m| m.text.as_str()).collect();
        let expected: Vec<_> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
        assert!(log.all().windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
        assert!(log.all().windows(2).all(|w| w[0].id != w[1].id));
    }

    #[test]
    fn timestamps_never_decrease() {
        let mut log = MessageLog::new();
        let first = log.append(draft("a", "b", "now")).sent_at;

        let mut stale = draft("a", "b", "from the past");
        stale.sent_at = Some(first - Duration::seconds(30));
        assert_eq!(log.append(stale).sent_at, first);
    }

    #[test]
    fn keeps_supplied_id() {
        let mut log = MessageLog::new();
        let mut d = draft("a", "b", "x");
        d.id = Some("msg_1".into());
        assert_eq!(log.append(d).id, "msg_1");
    }

    #[test]
    fn for_pair_is_symmetric_and_exact() {
        let mut log = MessageLog::new();
        log.append(draft("user1", "admin1", "1"));
        log.append(draft("admin1", "user1", "2"));
        log.append(draft("user2", "admin1", "3"));
        log.append(draft("user1", "user10", "4"));
        log.append(draft("admin1", "user1", "5"));

        let ab: Vec<_> = log.for_pair("user1", "admin1").collect();
        let ba: Vec<_> = log.for_pair("admin1", "user1").collect();
        assert_eq!(ab, ba);
        assert_eq!(ab.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["1", "2", "5"]);
        assert!(ab.iter().all(|m| m.is_between("user1", "admin1")));
    }
}
