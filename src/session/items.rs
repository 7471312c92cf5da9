use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::{ConversationItem, ItemStatus, Role};

/// All conversation items plus the capped, ordered list shown to the user.
///
/// Items enter the visible list when they complete. Once it exceeds
/// `max_visible`, the oldest entries leave the list but stay in storage.
///
/// Locally echoed user turns get a local id; when the server later announces
/// its own id for that turn, the server id is aliased to the local one.
#[derive(Debug)]
pub struct ConversationStore {
    items: HashMap<String, ConversationItem>,
    order: Vec<String>,
    visible: VecDeque<String>,
    max_visible: usize,
    aliases: HashMap<String, String>,
    pending_echoes: VecDeque<String>,
}

impl ConversationStore {
    pub fn new(max_visible: usize) -> Self {
        Self {
            items: HashMap::new(),
            order: Vec::new(),
            visible: VecDeque::new(),
            max_visible: max_visible.max(1),
            aliases: HashMap::new(),
            pending_echoes: VecDeque::new(),
        }
    }

    fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn get(&self, id: &str) -> Option<&ConversationItem> {
        self.items.get(self.resolve(id))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ConversationItem> {
        let key = self.resolve(id).to_string();
        self.items.get_mut(&key)
    }

    /// Look up `id`, creating a streaming item if it is new. The flag is
    /// `true` when the item was created.
    pub fn get_or_create_streaming(&mut self, id: &str, role: Role) -> (ConversationItem, bool) {
        if let Some(item) = self.get(id) {
            return (item.clone(), false);
        }
        let item = ConversationItem::streaming(id, role);
        self.order.push(id.to_string());
        self.items.insert(id.to_string(), item.clone());
        debug!(item_id = id, %role, "Conversation item created");
        (item, true)
    }

    /// Store an already completed item (local echo, text turn).
    pub fn insert_completed(&mut self, item: ConversationItem) {
        let id = item.id.clone();
        if self.items.insert(id.clone(), item).is_none() {
            self.order.push(id.clone());
        }
        self.show(id);
    }

    /// Append streamed transcript text. Ignored once the item completed.
    pub fn append_transcript(&mut self, id: &str, delta: &str) -> Option<ConversationItem> {
        let item = self.get_mut(id)?;
        if item.status != ItemStatus::Streaming {
            return None;
        }
        item.transcript.get_or_insert_with(String::new).push_str(delta);
        Some(item.clone())
    }

    /// Replace the transcript. Input transcriptions arrive after the local
    /// echo has already completed, so this works in either status.
    pub fn set_transcript(&mut self, id: &str, transcript: &str) -> Option<ConversationItem> {
        let item = self.get_mut(id)?;
        item.transcript = Some(transcript.to_string());
        Some(item.clone())
    }

    /// Complete a streaming item, attaching its artifact. Returns `None` if
    /// the item is unknown or already completed.
    pub fn seal(&mut self, id: &str, artifact_url: Option<String>) -> Option<ConversationItem> {
        let item = self.get_mut(id)?;
        if item.status == ItemStatus::Completed {
            return None;
        }
        item.status = ItemStatus::Completed;
        item.audio_artifact_url = artifact_url;
        let item = item.clone();
        self.show(item.id.clone());
        Some(item)
    }

    fn show(&mut self, id: String) {
        if self.visible.contains(&id) {
            return;
        }
        self.visible.push_back(id);
        while self.visible.len() > self.max_visible {
            if let Some(dropped) = self.visible.pop_front() {
                debug!(item_id = %dropped, "Item left visible list");
            }
        }
    }

    /// Remember a local echo waiting for its server-side id.
    pub fn push_echo(&mut self, local_id: &str) {
        self.pending_echoes.push_back(local_id.to_string());
    }

    /// Alias `server_id` to the oldest pending echo, if any.
    pub fn claim_echo(&mut self, server_id: &str) -> Option<String> {
        let local = self.pending_echoes.pop_front()?;
        self.aliases.insert(server_id.to_string(), local.clone());
        Some(local)
    }

    /// Forget the oldest pending echo without aliasing it. Used when the
    /// server rejects the commit that echo was waiting on.
    pub fn drop_echo(&mut self) -> Option<String> {
        self.pending_echoes.pop_front()
    }

    /// Visible items, oldest first.
    pub fn visible(&self) -> Vec<&ConversationItem> {
        self.visible.iter().filter_map(|id| self.items.get(id)).collect()
    }

    /// Every stored item in creation order.
    pub fn all(&self) -> Vec<&ConversationItem> {
        self.order.iter().filter_map(|id| self.items.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
        self.visible.clear();
        self.aliases.clear();
        self.pending_echoes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: &str) -> ConversationItem {
        ConversationItem {
            status: ItemStatus::Completed,
            ..ConversationItem::streaming(id, Role::User)
        }
    }

    #[test]
    fn test_visible_list_drops_oldest_but_keeps_storage() {
        let mut store = ConversationStore::new(2);
        for id in ["a", "b", "c"] {
            store.insert_completed(completed(id));
        }
        let visible: Vec<&str> = store.visible().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(visible, vec!["b", "c"]);
        assert_eq!(store.len(), 3);
        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_streaming_items_are_not_visible_until_sealed() {
        let mut store = ConversationStore::new(10);
        let (_, created) = store.get_or_create_streaming("a1", Role::Assistant);
        assert!(created);
        assert!(store.visible().is_empty());

        let (_, created) = store.get_or_create_streaming("a1", Role::Assistant);
        assert!(!created);

        let sealed = store.seal("a1", Some("artifact://x.wav".into())).unwrap();
        assert_eq!(sealed.status, ItemStatus::Completed);
        assert_eq!(store.visible().len(), 1);
        assert!(store.seal("a1", None).is_none());
    }

    #[test]
    fn test_transcript_deltas_stop_after_completion() {
        let mut store = ConversationStore::new(10);
        store.get_or_create_streaming("a1", Role::Assistant);
        store.append_transcript("a1", "Hel");
        store.append_transcript("a1", "lo");
        assert_eq!(store.get("a1").unwrap().transcript.as_deref(), Some("Hello"));

        store.seal("a1", None);
        assert!(store.append_transcript("a1", "!").is_none());
        assert_eq!(store.get("a1").unwrap().transcript.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_echo_alias_resolves_server_id() {
        let mut store = ConversationStore::new(10);
        store.insert_completed(completed("local_1"));
        store.push_echo("local_1");

        assert_eq!(store.claim_echo("item_srv").as_deref(), Some("local_1"));
        assert!(store.claim_echo("item_other").is_none());

        store.set_transcript("item_srv", "what's the weather");
        assert_eq!(
            store.get("local_1").unwrap().transcript.as_deref(),
            Some("what's the weather")
        );
    }

    #[test]
    fn test_dropped_echo_is_not_aliased() {
        let mut store = ConversationStore::new(10);
        store.insert_completed(completed("local_1"));
        store.insert_completed(completed("local_2"));
        store.push_echo("local_1");
        store.push_echo("local_2");

        assert_eq!(store.drop_echo().as_deref(), Some("local_1"));
        assert_eq!(store.claim_echo("item_srv").as_deref(), Some("local_2"));
        assert_eq!(store.get("item_srv").unwrap().id, "local_2");
        assert!(store.drop_echo().is_none());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut store = ConversationStore::new(10);
        store.insert_completed(completed("a"));
        store.push_echo("a");
        store.clear();
        assert!(store.is_empty());
        assert!(store.visible().is_empty());
        assert!(store.claim_echo("x").is_none());
    }
}
