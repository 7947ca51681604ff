use agent_relay_chat_schema::{ConversationTurn, UiMessage};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Change notification for a [`Conversation`]. Subscribers receive only the delta.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    TurnAdded {
        index: usize,
        turn: ConversationTurn,
    },
    MessageAppended {
        turn_index: usize,
        message: UiMessage,
    },
    /// The active assistant turn was closed by a terminal record, or by the caller on abort.
    RunFinished { turn_index: usize },
}

/// Ordered user and assistant turns with an append-only active assistant turn.
#[derive(Debug)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
    active: Option<usize>,
    updates: broadcast::Sender<ConversationUpdate>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        let (updates, _rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            turns: Vec::new(),
            active: None,
            updates,
        }
    }

    /// Seed from persisted history. Every loaded turn is frozen.
    pub fn from_turns(turns: Vec<ConversationTurn>) -> Self {
        let mut conversation = Self::new();
        conversation.turns = turns;
        conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Index of the assistant turn still accepting records, if any.
    pub fn active_turn(&self) -> Option<usize> {
        self.active
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.finish_active();
        self.push_turn(ConversationTurn::user(text))
    }

    /// Opens a new assistant turn; the previous one, if still open, is frozen first.
    pub fn begin_assistant(&mut self) -> usize {
        self.finish_active();
        let index = self.push_turn(ConversationTurn::assistant(Vec::new()));
        self.active = Some(index);
        index
    }

    /// Appends to the active assistant turn. Returns `false` when no turn is accepting
    /// records, which happens after a terminal record closed it.
    pub fn append(&mut self, message: UiMessage) -> bool {
        let Some(turn_index) = self.active else {
            tracing::warn!(
                kind = message.kind(),
                "dropping chat record received after the run finished"
            );
            return false;
        };
        let terminal = message.is_terminal();
        if let Some(ConversationTurn::Assistant { messages }) = self.turns.get_mut(turn_index) {
            messages.push(message.clone());
        }
        let _ = self.updates.send(ConversationUpdate::MessageAppended {
            turn_index,
            message,
        });
        if terminal {
            self.finish_active();
        }
        true
    }

    /// Freezes the active turn as-is. Used for a user abort, which records nothing.
    pub fn finish_active(&mut self) {
        if let Some(turn_index) = self.active.take() {
            let _ = self
                .updates
                .send(ConversationUpdate::RunFinished { turn_index });
        }
    }

    /// Messages of the most recent assistant turn.
    pub fn last_assistant_messages(&self) -> &[UiMessage] {
        self.turns
            .iter()
            .rev()
            .find_map(|turn| match turn {
                ConversationTurn::Assistant { messages } => Some(messages.as_slice()),
                ConversationTurn::User { .. } => None,
            })
            .unwrap_or_default()
    }

    fn push_turn(&mut self, turn: ConversationTurn) -> usize {
        let index = self.turns.len();
        self.turns.push(turn.clone());
        let _ = self
            .updates
            .send(ConversationUpdate::TurnAdded { index, turn });
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_deltas_in_order() {
        let mut conversation = Conversation::new();
        let mut updates = conversation.subscribe();

        conversation.push_user("add a test");
        let turn_index = conversation.begin_assistant();
        assert!(conversation.append(UiMessage::text("Sure")));
        assert!(conversation.append(UiMessage::error("Agent ended with: error_max_turns")));

        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::TurnAdded {
                index: 0,
                turn: ConversationTurn::user("add a test"),
            }
        );
        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::TurnAdded {
                index: 1,
                turn: ConversationTurn::assistant(Vec::new()),
            }
        );
        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::MessageAppended {
                turn_index,
                message: UiMessage::text("Sure"),
            }
        );
        assert!(matches!(
            updates.recv().await.unwrap(),
            ConversationUpdate::MessageAppended { .. }
        ));
        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::RunFinished { turn_index }
        );
    }

    #[test]
    fn turn_is_frozen_after_terminal_record() {
        let mut conversation = Conversation::new();
        conversation.push_user("hi");
        conversation.begin_assistant();
        conversation.append(UiMessage::text("hello"));
        conversation.append(UiMessage::RunResult {
            subtype: "success".to_string(),
            cost_usd: 0.0,
            duration_ms: 10,
        });
        assert!(!conversation.append(UiMessage::tool_result("toolu_late", "late")));
        assert_eq!(conversation.active_turn(), None);
        assert_eq!(conversation.last_assistant_messages().len(), 2);
    }

    #[test]
    fn history_turns_are_frozen() {
        let mut conversation = Conversation::from_turns(vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant(vec![UiMessage::text("hello")]),
        ]);
        assert!(!conversation.append(UiMessage::text("more")));
        assert_eq!(conversation.turns().len(), 2);
        assert_eq!(
            conversation.last_assistant_messages(),
            &[UiMessage::text("hello")]
        );
    }
}
