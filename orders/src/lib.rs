//! Order template library: a catalog of parametrized order bodies, a durable settings
//! context merged into every generated document, and category wizards that assemble
//! documents from structured form state.
//! Generation stays pure; persistence and change notification live behind the
//! `storage` seams so several open views can share one store.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TemplateId(pub String);

    impl From<&str> for TemplateId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for TemplateId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Handle returned by `ChangeBus::subscribe`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SubscriptionId(pub Uuid);

    impl SubscriptionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Free-form search tag attached to a template.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /// Input kind of a builder field; drives normalization at the write boundary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum FieldKind {
        Text,
        Textarea,
        Number,
        Date,
        Url,
    }

    /// Optional sentence gated by a boolean flag plus the owning field's value.
    ///
    /// `text` carries a `{value}` slot. The fragment is addressed in bodies as
    /// `{<token>}` and expands to the empty string unless the flag is set and the
    /// field is non-empty.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Fragment {
        pub token: String,
        pub flag: String,
        pub text: String,
    }

    impl Fragment {
        pub fn new(token: &str, flag: &str, text: &str) -> Self {
            Self {
                token: token.to_string(),
                flag: flag.to_string(),
                text: text.to_string(),
            }
        }

        pub fn expand(&self, value: &str, shown: bool) -> String {
            let value = value.trim();
            if !shown || value.is_empty() {
                return String::new();
            }
            self.text.replace("{value}", value)
        }
    }

    /// One free-form input a template needs beyond the settings context.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BuilderField {
        pub key: String,
        pub label: String,
        #[serde(rename = "type")]
        pub kind: FieldKind,
        #[serde(default)]
        pub placeholder: Option<String>,
        #[serde(default)]
        pub fragment: Option<Fragment>,
    }

    impl BuilderField {
        pub fn new(key: &str, label: &str, kind: FieldKind) -> Self {
            Self {
                key: key.to_string(),
                label: label.to_string(),
                kind,
                placeholder: None,
                fragment: None,
            }
        }

        pub fn with_placeholder(mut self, placeholder: &str) -> Self {
            self.placeholder = Some(placeholder.to_string());
            self
        }

        pub fn with_fragment(mut self, fragment: Fragment) -> Self {
            self.fragment = Some(fragment);
            self
        }
    }

    /// Ordered field descriptors for a template.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BuilderMeta {
        #[serde(default)]
        pub fields: Vec<BuilderField>,
    }

    impl BuilderMeta {
        pub fn new(fields: Vec<BuilderField>) -> Self {
            Self { fields }
        }

        pub fn field(&self, key: &str) -> Option<&BuilderField> {
            self.fields.iter().find(|f| f.key == key)
        }

        pub fn fragments(&self) -> impl Iterator<Item = (&BuilderField, &Fragment)> {
            self.fields
                .iter()
                .filter_map(|f| f.fragment.as_ref().map(|frag| (f, frag)))
        }

        /// True when `key` names a fragment's show flag.
        pub fn is_flag(&self, key: &str) -> bool {
            self.fragments().any(|(_, frag)| frag.flag == key)
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// An immutable order body with placeholder tokens.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Template {
        pub id: TemplateId,
        pub title: String,
        pub category: String,
        #[serde(default)]
        pub tags: Vec<Tag>,
        pub body: String,
        #[serde(default)]
        pub builder: Option<BuilderMeta>,
    }

    impl Template {
        pub fn new(id: &str, title: &str, category: &str, body: &str) -> Self {
            Self {
                id: TemplateId::from(id),
                title: title.to_string(),
                category: category.to_string(),
                tags: vec![],
                body: body.to_string(),
                builder: None,
            }
        }

        pub fn with_tags(mut self, tags: &[&str]) -> Self {
            self.tags = tags.iter().map(|t| Tag::from(*t)).collect();
            self
        }

        pub fn with_builder(mut self, fields: Vec<BuilderField>) -> Self {
            self.builder = Some(BuilderMeta::new(fields));
            self
        }

        /// Bodies already opening with a `[...]` line carry their own header.
        pub fn has_header(&self) -> bool {
            self.body.trim_start().starts_with('[')
        }
    }

    /// Values for one template's builder fields, in declaration order.
    pub type FieldValues = IndexMap<String, String>;

    /// Form inputs deliver booleans as strings; accept the usual truthy spellings.
    pub fn parse_flag(raw: &str) -> bool {
        matches!(
            raw.trim().to_lowercase().as_str(),
            "true" | "1" | "on" | "yes"
        )
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("storage i/o failed for {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid stored json: {0}")]
        Json(#[from] serde_json::Error),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum FieldError {
        #[error("template {0} declares no builder fields")]
        NoBuilder(TemplateId),
        #[error("template {template} has no field {key:?}")]
        UnknownField { template: TemplateId, key: String },
    }

    #[derive(Debug, thiserror::Error)]
    pub enum CatalogError {
        #[error("invalid catalog json: {0}")]
        Json(#[from] serde_json::Error),
        #[error("duplicate template id {0}")]
        DuplicateId(TemplateId),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ClipboardError {
        #[error("clipboard unavailable: {0}")]
        Unavailable(String),
        #[error("clipboard write failed: {0}")]
        Io(#[from] std::io::Error),
    }
}

pub mod lookup {
    //! Static tables consumed by the header line: position codes and the facility
    //! serving each city.

    pub const POSITIONS: &[(&str, &str)] = &[
        ("gv", "Главный Врач"),
        ("zgv", "Заместитель Главного Врача"),
        ("zav", "Заведующий Отделением"),
        ("vrach", "Врач"),
        ("ord", "Ординатор"),
    ];

    pub const CITY_HOSPITALS: &[(&str, &str)] = &[
        ("Мирный", "ЦГБ"),
        ("Приволжск", "ГКБ"),
        ("Невский", "ОКБ"),
    ];

    pub fn position_label(code: &str) -> Option<&'static str> {
        let code = code.trim();
        POSITIONS
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(code))
            .map(|(_, label)| *label)
    }

    pub fn hospital_for_city(city: &str) -> Option<&'static str> {
        let city = city.trim().to_lowercase();
        CITY_HOSPITALS
            .iter()
            .find(|(c, _)| c.to_lowercase() == city)
            .map(|(_, hospital)| *hospital)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn city_lookup_ignores_case_and_padding() {
            assert_eq!(hospital_for_city(" мирный "), Some("ЦГБ"));
            assert_eq!(hospital_for_city("Атлантида"), None);
        }

        #[test]
        fn position_codes_resolve_to_labels() {
            assert_eq!(position_label("gv"), Some("Главный Врач"));
            assert_eq!(position_label("GV"), Some("Главный Врач"));
            assert_eq!(position_label("nope"), None);
        }
    }
}

pub mod storage {
    //! Seams to the outside world: a durable key-value store, the change bus other
    //! open views listen on, and the clipboard.

    use crate::core::{ClipboardError, StoreError, SubscriptionId, TemplateId};
    use parking_lot::{Mutex, RwLock, const_mutex};
    use std::{
        collections::{BTreeMap, HashMap},
        fmt, fs,
        io::{self, Write},
        path::{Path, PathBuf},
        sync::Arc,
    };
    use tempfile::NamedTempFile;
    use tracing::{debug, warn};

    /// Durable string store; every `set` is atomic for its key.
    pub trait KeyValueStore: Send + Sync {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
        fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    }

    pub trait Clipboard {
        fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
    }

    /* ------------------------------ Memory ------------------------------ */

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        entries: RwLock<HashMap<String, String>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl KeyValueStore for MemoryStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.entries.read().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.entries
                .write()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    /* ------------------------------- File ------------------------------- */

    /// One write lock per store file, shared by every `FileStore` opened on it in this
    /// process.
    static FILE_LOCKS: Mutex<BTreeMap<PathBuf, Arc<Mutex<()>>>> = const_mutex(BTreeMap::new());

    fn lock_for(path: &Path) -> Arc<Mutex<()>> {
        let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Arc::clone(FILE_LOCKS.lock().entry(key).or_default())
    }

    /// All keys in one JSON object on disk, rewritten through a uniquely named temp file
    /// that is then renamed over the store.
    #[derive(Debug)]
    pub struct FileStore {
        path: PathBuf,
        write_lock: Arc<Mutex<()>>,
    }

    impl FileStore {
        pub fn open(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let write_lock = lock_for(&path);
            Self { path, write_lock }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
            let text = match fs::read_to_string(&self.path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            };
            if text.trim().is_empty() {
                return Ok(BTreeMap::new());
            }
            match serde_json::from_str(&text) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    warn!(path = ?self.path, %err, "store file is corrupt; treating as empty");
                    Ok(BTreeMap::new())
                }
            }
        }

        fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
            let json = serde_json::to_string_pretty(entries)?;
            let dir = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let io_err = |source: io::Error| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            };
            let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
            tmp.write_all(json.as_bytes()).map_err(io_err)?;
            tmp.persist(&self.path).map_err(|err| StoreError::Io {
                path: self.path.clone(),
                source: err.error,
            })?;
            Ok(())
        }
    }

    impl KeyValueStore for FileStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.read_all()?.remove(key))
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            let _guard = self.write_lock.lock();
            let mut entries = self.read_all()?;
            entries.insert(key.to_string(), value.to_string());
            self.write_entries(&entries)
        }
    }

    /* ---------------------------- Change bus ---------------------------- */

    /// What changed in the durable store.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ChangeEvent {
        Settings,
        ExtraFields(TemplateId),
        Penalty,
    }

    type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

    /// Fire-and-forget pub/sub; callbacks run outside the subscriber lock.
    #[derive(Default)]
    pub struct ChangeBus {
        subscribers: RwLock<Vec<(SubscriptionId, Callback)>>,
    }

    impl ChangeBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
        where
            F: Fn(&ChangeEvent) + Send + Sync + 'static,
        {
            let id = SubscriptionId::new();
            self.subscribers.write().push((id, Arc::new(callback)));
            id
        }

        pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
            let mut subs = self.subscribers.write();
            let before = subs.len();
            subs.retain(|(sid, _)| *sid != id);
            subs.len() != before
        }

        pub fn publish(&self, event: &ChangeEvent) {
            let snapshot: Vec<Callback> = self
                .subscribers
                .read()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            debug!(?event, listeners = snapshot.len(), "publishing change");
            for cb in snapshot {
                cb(event);
            }
        }

        pub fn subscriber_count(&self) -> usize {
            self.subscribers.read().len()
        }
    }

    impl fmt::Debug for ChangeBus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ChangeBus")
                .field("subscribers", &self.subscriber_count())
                .finish()
        }
    }

    /* ------------------------------ Handle ------------------------------ */

    /// Shared handle every store view is built from.
    #[derive(Debug, Clone)]
    pub struct Storage {
        pub kv: Arc<dyn KeyValueStore>,
        pub bus: Arc<ChangeBus>,
    }

    impl fmt::Debug for dyn KeyValueStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("KeyValueStore")
        }
    }

    impl Storage {
        pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
            Self {
                kv,
                bus: Arc::new(ChangeBus::new()),
            }
        }

        pub fn in_memory() -> Self {
            Self::new(Arc::new(MemoryStore::new()))
        }

        pub fn file(path: impl Into<PathBuf>) -> Self {
            Self::new(Arc::new(FileStore::open(path)))
        }

        /// Read a key, folding storage errors into "absent".
        pub fn read(&self, key: &str) -> Option<String> {
            match self.kv.get(key) {
                Ok(value) => value,
                Err(err) => {
                    warn!(key, %err, "storage read failed");
                    None
                }
            }
        }

        /// Write a key and announce it. Failures are logged and swallowed; the event
        /// only fires after a successful write.
        pub fn persist(&self, key: &str, value: &str, event: ChangeEvent) -> bool {
            match self.kv.set(key, value) {
                Ok(()) => {
                    self.bus.publish(&event);
                    true
                }
                Err(err) => {
                    warn!(key, %err, "failed to persist; change kept in memory only");
                    false
                }
            }
        }
    }

}

pub mod settings {
    //! The durable context merged into every generated document.
    //!
    //! `Settings` is a plain value with a single normalizing entry point
    //! (`Settings::apply`). `SettingsStore` is one open view over the shared store:
    //! it caches the current value, writes through on every update, and reloads
    //! whenever any view announces a change, so concurrently open editors converge
    //! on the last write.

    use crate::core::{SubscriptionId, parse_flag};
    use crate::lookup;
    use crate::storage::{ChangeEvent, KeyValueStore, Storage};
    use crate::substitution::{parse_counter, COUNTER_MAX, V_MAX};
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, PickFirst, serde_as};
    use std::{fmt, str::FromStr, sync::Arc};
    use tracing::{debug, warn};

    pub const SETTINGS_KEY: &str = "orders:settings";

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Settings {
        /// Position code, resolved through `lookup::POSITIONS`.
        pub position: String,
        /// Free-text position label; wins over `position` when set.
        pub position_custom: String,
        pub hospital: String,
        /// Set when `hospital` was typed in rather than derived from `city`.
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub hospital_override: bool,
        pub city: String,
        pub my_name: String,
        pub target_name: String,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub up: u8,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub p: u8,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub v: u8,
        pub header_custom_title: String,
        /// When true the custom title is ignored.
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub header_show_hospital_city: bool,
    }

    impl Default for Settings {
        fn default() -> Self {
            let city = "Мирный".to_string();
            Self {
                position: "gv".into(),
                position_custom: String::new(),
                hospital: lookup::hospital_for_city(&city)
                    .unwrap_or_default()
                    .to_string(),
                hospital_override: false,
                city,
                my_name: String::new(),
                target_name: String::new(),
                up: 0,
                p: 0,
                v: 0,
                header_custom_title: String::new(),
                header_show_hospital_city: true,
            }
        }
    }

    impl Settings {
        pub fn position_label(&self) -> &str {
            let custom = self.position_custom.trim();
            if !custom.is_empty() {
                return custom;
            }
            lookup::position_label(&self.position).unwrap_or(self.position.as_str())
        }

        /// The facility name used in output: the explicit override if one was typed,
        /// otherwise the city lookup. A city missing from the table has no facility.
        pub fn resolved_hospital(&self) -> &str {
            if self.hospital_override && !self.hospital.trim().is_empty() {
                return &self.hospital;
            }
            lookup::hospital_for_city(&self.city).unwrap_or_default()
        }

        /// Re-establish invariants on a value read back from storage.
        pub fn normalized(mut self) -> Self {
            self.up = self.up.min(COUNTER_MAX);
            self.p = self.p.min(COUNTER_MAX);
            self.v = self.v.min(V_MAX);
            if !self.hospital_override {
                self.hospital = lookup::hospital_for_city(&self.city)
                    .unwrap_or_default()
                    .to_string();
            }
            self
        }

        /// Apply one raw form input. Returns false when the input is rejected
        /// (non-numeric counter), leaving the settings untouched.
        pub fn apply(&mut self, key: SettingKey, raw: &str) -> bool {
            match key {
                SettingKey::Position => self.position = raw.to_string(),
                SettingKey::PositionCustom => self.position_custom = raw.to_string(),
                SettingKey::Hospital => {
                    self.hospital = raw.to_string();
                    self.hospital_override = !raw.trim().is_empty();
                    if !self.hospital_override {
                        self.hospital = lookup::hospital_for_city(&self.city)
                            .unwrap_or_default()
                            .to_string();
                    }
                }
                SettingKey::City => {
                    self.city = raw.to_string();
                    self.hospital_override = false;
                    self.hospital = lookup::hospital_for_city(raw)
                        .unwrap_or_default()
                        .to_string();
                }
                SettingKey::MyName => self.my_name = raw.to_string(),
                SettingKey::TargetName => self.target_name = raw.to_string(),
                SettingKey::Up | SettingKey::P | SettingKey::V => {
                    let max = if key == SettingKey::V { V_MAX } else { COUNTER_MAX };
                    let Some(n) = parse_counter(raw, max) else {
                        return false;
                    };
                    match key {
                        SettingKey::Up => self.up = n,
                        SettingKey::P => self.p = n,
                        _ => self.v = n,
                    }
                }
                SettingKey::HeaderCustomTitle => self.header_custom_title = raw.to_string(),
                SettingKey::HeaderShowHospitalCity => {
                    self.header_show_hospital_city = parse_flag(raw)
                }
            }
            true
        }
    }

    /* ------------------------------ Keys ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum SettingKey {
        Position,
        PositionCustom,
        Hospital,
        City,
        MyName,
        TargetName,
        Up,
        P,
        V,
        HeaderCustomTitle,
        HeaderShowHospitalCity,
    }

    impl SettingKey {
        pub const ALL: [SettingKey; 11] = [
            SettingKey::Position,
            SettingKey::PositionCustom,
            SettingKey::Hospital,
            SettingKey::City,
            SettingKey::MyName,
            SettingKey::TargetName,
            SettingKey::Up,
            SettingKey::P,
            SettingKey::V,
            SettingKey::HeaderCustomTitle,
            SettingKey::HeaderShowHospitalCity,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                SettingKey::Position => "position",
                SettingKey::PositionCustom => "positionCustom",
                SettingKey::Hospital => "hospital",
                SettingKey::City => "city",
                SettingKey::MyName => "myName",
                SettingKey::TargetName => "targetName",
                SettingKey::Up => "up",
                SettingKey::P => "p",
                SettingKey::V => "v",
                SettingKey::HeaderCustomTitle => "headerCustomTitle",
                SettingKey::HeaderShowHospitalCity => "headerShowHospitalCity",
            }
        }
    }

    impl fmt::Display for SettingKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("unknown setting {0:?}")]
    pub struct UnknownSettingKey(pub String);

    impl FromStr for SettingKey {
        type Err = UnknownSettingKey;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            SettingKey::ALL
                .into_iter()
                .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
                .ok_or_else(|| UnknownSettingKey(s.to_string()))
        }
    }

    /* ------------------------------ Store ------------------------------ */

    /// Read settings, falling back to defaults when absent or unparsable.
    pub fn load(kv: &dyn KeyValueStore) -> Settings {
        match kv.get(SETTINGS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => settings.normalized(),
                Err(err) => {
                    warn!(%err, "stored settings are corrupt; using defaults");
                    Settings::default()
                }
            },
            Ok(None) => Settings::default(),
            Err(err) => {
                warn!(%err, "settings unreadable; using defaults");
                Settings::default()
            }
        }
    }

    pub struct SettingsStore {
        storage: Storage,
        current: Arc<RwLock<Settings>>,
        subscription: SubscriptionId,
    }

    impl SettingsStore {
        pub fn open(storage: Storage) -> Self {
            let current = Arc::new(RwLock::new(load(storage.kv.as_ref())));
            let view = Arc::clone(&current);
            let kv = Arc::clone(&storage.kv);
            let subscription = storage.bus.subscribe(move |event| {
                if *event == ChangeEvent::Settings {
                    *view.write() = load(kv.as_ref());
                }
            });
            Self {
                storage,
                current,
                subscription,
            }
        }

        pub fn get(&self) -> Settings {
            self.current.read().clone()
        }

        /// Single mutation entry point. Persistence failures are swallowed.
        pub fn update(&self, key: SettingKey, raw: &str) {
            let snapshot = {
                let mut guard = self.current.write();
                if !guard.apply(key, raw) {
                    debug!(%key, raw, "rejected settings input");
                    return;
                }
                guard.clone()
            };
            debug!(%key, "settings updated");
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    self.storage
                        .persist(SETTINGS_KEY, &json, ChangeEvent::Settings);
                }
                Err(err) => warn!(%err, "failed to encode settings"),
            }
        }
    }

    impl Drop for SettingsStore {
        fn drop(&mut self) {
            self.storage.bus.unsubscribe(self.subscription);
        }
    }

    impl fmt::Debug for SettingsStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SettingsStore")
                .field("current", &*self.current.read())
                .finish()
        }
    }

}

pub mod substitution {
    //! Token substitution over order bodies.
    //!
    //! Tokens are `{KEY}` with `KEY` in `[A-Za-z0-9_]+`; they are located with a small
    //! `nom` scanner so stray braces survive as plain text. A token without a value is
    //! left in place verbatim, which keeps half-filled documents previewable.

    use crate::core::{BuilderMeta, FieldKind, FieldValues, parse_flag};
    use crate::settings::Settings;
    use chrono::NaiveDate;
    use indexmap::IndexSet;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, take_while1},
        combinator::map,
        error::VerboseError,
        multi::many0,
        sequence::delimited,
    };
    use std::collections::HashMap;

    pub const COUNTER_MAX: u8 = 5;
    pub const V_MAX: u8 = 3;

    /// Settings-backed tokens understood by `replace_in_content`.
    pub const SETTINGS_TOKENS: [&str; 8] = [
        "HOSPITAL_FULL",
        "HOSPITAL",
        "CITY",
        "MY_NAME",
        "TARGET_NAME",
        "UP",
        "P",
        "V",
    ];

    const STATE_PHRASES: [&str; 2] = ["текущее состояние", "текущее положение"];

    /* ------------------------------ Scanner ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Segment<'a> {
        Text(&'a str),
        Token(&'a str),
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Split a body into literal text and token names.
    pub fn scan(body: &str) -> Vec<Segment<'_>> {
        match many0(segment)(body) {
            Ok((rest, mut segments)) => {
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest));
                }
                segments
            }
            Err(_) => vec![Segment::Text(body)],
        }
    }

    fn segment(i: &str) -> PResult<'_, Segment<'_>> {
        alt((token, text, stray_brace))(i)
    }

    fn token(i: &str) -> PResult<'_, Segment<'_>> {
        map(
            delimited(tag("{"), take_while1(is_key_char), tag("}")),
            Segment::Token,
        )(i)
    }

    fn text(i: &str) -> PResult<'_, Segment<'_>> {
        map(is_not("{"), Segment::Text)(i)
    }

    fn stray_brace(i: &str) -> PResult<'_, Segment<'_>> {
        map(tag("{"), Segment::Text)(i)
    }

    fn is_key_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    /// Replace every token `resolve` knows; unknown tokens stay verbatim.
    pub fn substitute<F>(body: &str, mut resolve: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(body.len());
        for seg in scan(body) {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Token(key) => match resolve(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                },
            }
        }
        out
    }

    /// Distinct tokens still present in `text`, in order of first appearance.
    pub fn unresolved_tokens(text: &str) -> Vec<String> {
        scan(text)
            .into_iter()
            .filter_map(|seg| match seg {
                Segment::Token(key) => Some(key.to_string()),
                Segment::Text(_) => None,
            })
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }

    /* ------------------------------ Settings ------------------------------ */

    pub fn build_header_line(settings: &Settings) -> String {
        let title = settings.header_custom_title.trim();
        if !settings.header_show_hospital_city && !title.is_empty() {
            return format!("[{} | {}]", title, settings.my_name);
        }
        format!(
            "[{} {} города {} | {}]",
            settings.position_label(),
            settings.resolved_hospital(),
            settings.city,
            settings.my_name
        )
    }

    fn settings_token(settings: &Settings, key: &str) -> Option<String> {
        let value = match key {
            "HOSPITAL_FULL" => format!("{} города {}", settings.resolved_hospital(), settings.city),
            "HOSPITAL" => settings.resolved_hospital().to_string(),
            "CITY" => settings.city.clone(),
            "MY_NAME" => settings.my_name.clone(),
            "TARGET_NAME" => settings.target_name.clone(),
            "UP" => settings.up.to_string(),
            "P" => settings.p.to_string(),
            "V" => settings.v.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Inject the header when the body has none, then expand the settings tokens.
    pub fn replace_in_content(body: &str, settings: &Settings) -> String {
        replace_in_content_with(body, settings, |_| None)
    }

    /// `replace_in_content` with caller tokens tried before settings in the same pass.
    /// Substituted values are never rescanned, so typed-in braces stay literal.
    pub fn replace_in_content_with<F>(body: &str, settings: &Settings, mut resolve: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let expanded = substitute(body, |key| {
            resolve(key).or_else(|| settings_token(settings, key))
        });
        if body.trim_start().starts_with('[') {
            return expanded;
        }
        prepend_header(&expanded, settings)
    }

    /// Prepend the header line unless `text` already opens with one. No token expansion.
    pub fn with_header(text: &str, settings: &Settings) -> String {
        if text.trim_start().starts_with('[') {
            return text.to_string();
        }
        prepend_header(text, settings)
    }

    fn prepend_header(text: &str, settings: &Settings) -> String {
        let mut out = build_header_line(settings);
        out.push_str("\n\n");
        out.push_str(text);
        out
    }

    /* ---------------------------- Extra fields ---------------------------- */

    /// Expand per-template values and the derived fragment tokens the builder declares.
    /// Fragment tokens win over a same-named plain value; blank values leave the token visible.
    pub fn apply_extra_fields(
        body: &str,
        builder: Option<&BuilderMeta>,
        values: &FieldValues,
    ) -> String {
        let mut derived: HashMap<&str, String> = HashMap::new();
        if let Some(meta) = builder {
            for (field, fragment) in meta.fragments() {
                let value = values.get(&field.key).map(String::as_str).unwrap_or("");
                let shown = values.get(&fragment.flag).is_some_and(|f| parse_flag(f));
                derived.insert(fragment.token.as_str(), fragment.expand(value, shown));
            }
        }
        substitute(body, |key| {
            if let Some(line) = derived.get(key) {
                return Some(line.clone());
            }
            let value = values.get(key).filter(|v| !v.trim().is_empty())?;
            let is_date = builder
                .and_then(|m| m.field(key))
                .is_some_and(|f| f.kind == FieldKind::Date);
            Some(if is_date {
                format_date(value)
            } else {
                value.clone()
            })
        })
    }

    /* ------------------------------ Numbers ------------------------------ */

    pub fn clamp_counter(n: i64, max: u8) -> u8 {
        n.clamp(0, i64::from(max)) as u8
    }

    /// Parse a counter input; empty means zero, non-numeric input is rejected.
    pub fn parse_counter(raw: &str, max: u8) -> Option<u8> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(0);
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Some(clamp_counter(n, max));
        }
        // Integers too wide for i64 still clamp by sign.
        let digits = raw.strip_prefix('-').or_else(|| raw.strip_prefix('+'));
        match digits {
            Some(d) if !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()) => {
                Some(if raw.starts_with('-') { 0 } else { max })
            }
            None if raw.chars().all(|c| c.is_ascii_digit()) => Some(max),
            _ => None,
        }
    }

    /// Coerce a `number` builder field to a non-negative integer taken from the leading
    /// signed digits (whitespace ignored). Negatives become `0`; input without a leading
    /// number is rejected as `""`, which also lets the field be cleared.
    pub fn normalize_number_field(raw: &str) -> String {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let (negative, rest) = match compact.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, compact.strip_prefix('+').unwrap_or(&compact)),
        };
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let digits = &rest[..end];
        if digits.is_empty() {
            return String::new();
        }
        if negative {
            return "0".to_string();
        }
        match digits.trim_start_matches('0') {
            "" => "0".to_string(),
            d => d.to_string(),
        }
    }

    /// ISO dates (`YYYY-MM-DD`) render as `DD.MM.YYYY`; anything else is kept.
    pub fn format_date(raw: &str) -> String {
        match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(date) => date.format("%d.%m.%Y").to_string(),
            Err(_) => raw.to_string(),
        }
    }

    /* ------------------------------ Helpers ------------------------------ */

    /// Whether the counter editor is relevant for `source`. A miss only hides an input.
    pub fn has_state_line(source: &str) -> bool {
        if ["{UP}", "{P}", "{V}"].iter().any(|t| source.contains(t)) {
            return true;
        }
        let lower = source.to_lowercase();
        STATE_PHRASES.iter().any(|p| lower.contains(p))
    }

    /// Strip per-line indentation and outer whitespace. Only for clipboard writes.
    pub fn sanitize_for_copy(text: &str) -> String {
        text.split('\n')
            .map(str::trim_start)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

}

pub mod catalog {
    //! The immutable template library.

    use crate::core::{BuilderField, CatalogError, FieldKind, Fragment, Template};
    use indexmap::IndexSet;
    use std::collections::HashSet;

    pub const TARGET_DEPARTMENT_LINE: &str = "TARGET_DEPARTMENT_LINE";
    pub const SHOW_TARGET_DEPARTMENT: &str = "SHOW_TARGET_DEPARTMENT";

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TemplateCatalog {
        templates: Vec<Template>,
    }

    impl TemplateCatalog {
        pub fn new(templates: Vec<Template>) -> Result<Self, CatalogError> {
            let mut seen = HashSet::new();
            for t in &templates {
                if !seen.insert(&t.id) {
                    return Err(CatalogError::DuplicateId(t.id.clone()));
                }
            }
            Ok(Self { templates })
        }

        pub fn builtin() -> Self {
            Self {
                templates: builtin_templates(),
            }
        }

        /// Load a catalog from a JSON array of templates.
        pub fn from_json(text: &str) -> Result<Self, CatalogError> {
            let templates: Vec<Template> = serde_json::from_str(text)?;
            Self::new(templates)
        }

        pub fn list_templates(&self) -> &[Template] {
            &self.templates
        }

        /// Categories in order of first appearance.
        pub fn list_categories(&self) -> Vec<&str> {
            self.templates
                .iter()
                .map(|t| t.category.as_str())
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect()
        }

        pub fn get(&self, id: &str) -> Option<&Template> {
            self.templates.iter().find(|t| t.id.0 == id)
        }

        /// Case-insensitive substring match over title, body and tags, optionally
        /// restricted to one category. An empty query matches everything.
        pub fn search(&self, query: &str, category: Option<&str>) -> Vec<&Template> {
            let needle = query.trim().to_lowercase();
            self.templates
                .iter()
                .filter(|t| category.is_none_or(|c| t.category == c))
                .filter(|t| needle.is_empty() || matches_query(t, &needle))
                .collect()
        }
    }

    fn matches_query(t: &Template, needle: &str) -> bool {
        t.title.to_lowercase().contains(needle)
            || t.body.to_lowercase().contains(needle)
            || t.tags.iter().any(|tag| tag.0.to_lowercase().contains(needle))
    }

    const STATE_LINE: &str = "Текущее состояние: УП-{UP}/5, П-{P}/5, В-{V}/3.";

    fn builtin_templates() -> Vec<Template> {
        vec![
            Template::new(
                "reprimand",
                "Выговор",
                "Взыскания",
                &format!(
                    "Приказ о вынесении выговора\n\n{{TARGET_NAME}} получает выговор за {{VIOLATION}}.\n{STATE_LINE}"
                ),
            )
            .with_tags(&["выговор", "взыскание"])
            .with_builder(vec![
                BuilderField::new("VIOLATION", "Нарушение", FieldKind::Textarea)
                    .with_placeholder("опоздание на смену"),
            ]),
            Template::new(
                "warning",
                "Предупреждение",
                "Взыскания",
                &format!(
                    "Приказ о вынесении предупреждения\n\n{{TARGET_NAME}} получает устное предупреждение по пункту {{ARTICLE}} устава.\n{STATE_LINE}"
                ),
            )
            .with_tags(&["предупреждение", "устав"])
            .with_builder(vec![
                BuilderField::new("ARTICLE", "Пункт устава", FieldKind::Text)
                    .with_placeholder("2.4"),
            ]),
            Template::new(
                "enrollment",
                "Зачисление в штат",
                "Кадровые",
                "Приказ о зачислении\n\n{TARGET_NAME} зачисляется в штат {HOSPITAL_FULL} на должность {TARGET_POSITION}.{TARGET_DEPARTMENT_LINE}",
            )
            .with_tags(&["приём", "отдел"])
            .with_builder(vec![
                BuilderField::new("TARGET_POSITION", "Должность", FieldKind::Text)
                    .with_placeholder("Интерн"),
                BuilderField::new("TARGET_DEPARTMENT", "Отдел", FieldKind::Text)
                    .with_placeholder("Хирургическое отделение")
                    .with_fragment(Fragment::new(
                        TARGET_DEPARTMENT_LINE,
                        SHOW_TARGET_DEPARTMENT,
                        " Отдел: {value}.",
                    )),
            ]),
            Template::new(
                "promotion",
                "Повышение в должности",
                "Кадровые",
                "Приказ о повышении\n\n{TARGET_NAME} повышается до должности {NEW_POSITION} с {START_DATE}.",
            )
            .with_tags(&["повышение", "карьера"])
            .with_builder(vec![
                BuilderField::new("NEW_POSITION", "Новая должность", FieldKind::Text),
                BuilderField::new("START_DATE", "Дата вступления", FieldKind::Date),
            ]),
            Template::new(
                "bonus",
                "Премирование",
                "Поощрения",
                "Приказ о премировании\n\n{TARGET_NAME} премируется в размере {AMOUNT} рублей за {MERIT}.",
            )
            .with_tags(&["премия", "поощрение"])
            .with_builder(vec![
                BuilderField::new("AMOUNT", "Сумма", FieldKind::Number).with_placeholder("5000"),
                BuilderField::new("MERIT", "Заслуга", FieldKind::Textarea),
            ]),
            Template::new(
                "lecture",
                "Объявление о лекции",
                "Обучение",
                "[Отдел обучения {HOSPITAL} | {MY_NAME}]\n\nЛекция «{TOPIC}» состоится {DATE} в {TIME}.\nМатериалы: {LINK}",
            )
            .with_tags(&["лекция", "обучение"])
            .with_builder(vec![
                BuilderField::new("TOPIC", "Тема", FieldKind::Text),
                BuilderField::new("DATE", "Дата", FieldKind::Date),
                BuilderField::new("TIME", "Время", FieldKind::Text).with_placeholder("18:00"),
                BuilderField::new("LINK", "Ссылка", FieldKind::Url),
            ]),
            Template::new(
                "duty",
                "Назначение дежурного",
                "Общие",
                "Приказ о дежурстве\n\n{TARGET_NAME} назначается ответственным дежурным {HOSPITAL} города {CITY}.",
            )
            .with_tags(&["дежурство", "смена"]),
        ]
    }

}

pub mod extra_fields {
    //! Per-template values for builder fields, one storage key per template.

    use crate::core::{FieldError, FieldKind, FieldValues, Template, TemplateId, parse_flag};
    use crate::storage::{ChangeEvent, Storage};
    use crate::substitution::normalize_number_field;
    use tracing::{debug, warn};

    pub const EXTRA_FIELDS_PREFIX: &str = "orders:extra-fields:";

    pub fn storage_key(id: &TemplateId) -> String {
        format!("{EXTRA_FIELDS_PREFIX}{id}")
    }

    /// Normalize a raw input according to its field kind.
    pub fn normalize_field(kind: FieldKind, raw: &str) -> String {
        match kind {
            FieldKind::Number => normalize_number_field(raw),
            FieldKind::Url => raw.trim().to_string(),
            FieldKind::Text | FieldKind::Textarea | FieldKind::Date => raw.to_string(),
        }
    }

    #[derive(Debug, Clone)]
    pub struct ExtraFieldsStore {
        storage: Storage,
    }

    impl ExtraFieldsStore {
        pub fn new(storage: Storage) -> Self {
            Self { storage }
        }

        /// Current values shaped to the template's builder: every declared field in
        /// order (empty when unset), then every fragment flag (`"false"` when unset).
        pub fn values(&self, template: &Template) -> FieldValues {
            let stored = self.load_raw(&template.id);
            let mut out = FieldValues::new();
            let Some(meta) = &template.builder else {
                return out;
            };
            for field in &meta.fields {
                let value = stored.get(&field.key).cloned().unwrap_or_default();
                out.insert(field.key.clone(), value);
            }
            for (_, fragment) in meta.fragments() {
                let shown = stored.get(&fragment.flag).is_some_and(|f| parse_flag(f));
                out.insert(fragment.flag.clone(), shown.to_string());
            }
            out
        }

        /// Set one field or fragment flag. Keys are validated against the template's
        /// builder before anything is stored.
        pub fn set(&self, template: &Template, key: &str, raw: &str) -> Result<(), FieldError> {
            let meta = template
                .builder
                .as_ref()
                .ok_or_else(|| FieldError::NoBuilder(template.id.clone()))?;
            let value = if let Some(field) = meta.field(key) {
                normalize_field(field.kind, raw)
            } else if meta.is_flag(key) {
                parse_flag(raw).to_string()
            } else {
                return Err(FieldError::UnknownField {
                    template: template.id.clone(),
                    key: key.to_string(),
                });
            };

            let mut values = self.values(template);
            values.insert(key.to_string(), value);
            debug!(template = %template.id, key, "extra field updated");
            self.write(&template.id, &values);
            Ok(())
        }

        pub fn set_flag(&self, template: &Template, flag: &str, shown: bool) -> Result<(), FieldError> {
            self.set(template, flag, if shown { "true" } else { "false" })
        }

        /// Forget every value stored for the template.
        pub fn clear(&self, template: &Template) {
            self.write(&template.id, &FieldValues::new());
        }

        fn load_raw(&self, id: &TemplateId) -> FieldValues {
            let Some(raw) = self.storage.read(&storage_key(id)) else {
                return FieldValues::new();
            };
            serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(template = %id, %err, "stored extra fields are corrupt; starting empty");
                FieldValues::new()
            })
        }

        fn write(&self, id: &TemplateId, values: &FieldValues) {
            match serde_json::to_string(values) {
                Ok(json) => {
                    self.storage
                        .persist(&storage_key(id), &json, ChangeEvent::ExtraFields(id.clone()));
                }
                Err(err) => warn!(template = %id, %err, "failed to encode extra fields"),
            }
        }
    }

}

pub mod wizard {
    //! Template-free generation. Each category owns a fixed skeleton that is filled
    //! from the form; the result then takes one pass through `replace_in_content`,
    //! which injects the header and settings tokens.

    use crate::disciplinary::{DisciplinaryBuilder, build_disciplinary_text};
    use crate::settings::Settings;
    use crate::substitution::{format_date, has_state_line, replace_in_content_with, with_header};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use tracing::debug;

    pub const DEFAULT_DISMISSAL_REASON: &str = "по собственному желанию";
    pub const DEFAULT_OCHS_POINT: &str = "1.1";
    pub const DEFAULT_BLACKLIST_DAYS: u32 = 30;
    pub const PENALTY_FREE_CLAUSE: &str = " Неустойка не взимается.";

    const VACATION: &str = "Приказ о предоставлении отпуска\n\n\
        {TARGET_NAME}, занимающему должность {TARGET_POSITION}, предоставляется отпуск с {DATE_FROM} по {DATE_TO}.";
    const DISMISSAL: &str = "Приказ об увольнении\n\n\
        {TARGET_NAME}, занимающий должность {TARGET_POSITION}, увольняется {REASON}.{PENALTY_CLAUSE}\n\
        Текущее состояние: УП-{UP}/5, П-{P}/5, В-{V}/3.";
    const BLACKLIST: &str = "Приказ об увольнении с занесением в чёрный список\n\n\
        {TARGET_NAME}, занимающий должность {TARGET_POSITION}, увольняется с занесением в чёрный список \
        по пункту {OCHS_POINT} сроком на {BLACKLIST_DAYS} дней{OCHS_REASON}.\n\
        Текущее состояние: УП-{UP}/5, П-{P}/5, В-{V}/3.";
    const RECEPTION: &str = "Приказ о приёме на работу\n\n\
        {TARGET_NAME} принимается на должность {TARGET_POSITION}.";
    const TRANSFER: &str = "Приказ о переводе\n\n\
        {TARGET_NAME} переводится на должность {TARGET_POSITION}.";
    const ACTING: &str = "Приказ о назначении временно исполняющего обязанности\n\n\
        {TARGET_NAME} назначается временно исполняющим обязанности {TARGET_POSITION}.";
    const ASSIGNMENT: &str = "Приказ о назначении\n\n\
        {TARGET_NAME} назначается на должность {TARGET_POSITION}.";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum WizardCategory {
        Vacation,
        Dismissal,
        Reception,
        Transfer,
        ActingAppointment,
        Assignment,
        Disciplinary,
    }

    impl WizardCategory {
        pub const ALL: [WizardCategory; 7] = [
            WizardCategory::Vacation,
            WizardCategory::Dismissal,
            WizardCategory::Reception,
            WizardCategory::Transfer,
            WizardCategory::ActingAppointment,
            WizardCategory::Assignment,
            WizardCategory::Disciplinary,
        ];

        /// Routing value carried by `WizardForm::category`.
        pub fn label(self) -> &'static str {
            match self {
                WizardCategory::Vacation => "Отпуск",
                WizardCategory::Dismissal => "Увольнение",
                WizardCategory::Reception => "Приём",
                WizardCategory::Transfer => "Перевод",
                WizardCategory::ActingAppointment => "ВРИО",
                WizardCategory::Assignment => "Назначение",
                WizardCategory::Disciplinary => "Взыскания",
            }
        }

        pub fn from_label(label: &str) -> Option<Self> {
            let label = label.trim();
            if label == "Прием" {
                return Some(WizardCategory::Reception);
            }
            Self::ALL.into_iter().find(|c| c.label() == label)
        }

        fn skeleton(self) -> Option<&'static str> {
            match self {
                WizardCategory::Vacation => Some(VACATION),
                WizardCategory::Dismissal => Some(DISMISSAL),
                WizardCategory::Reception => Some(RECEPTION),
                WizardCategory::Transfer => Some(TRANSFER),
                WizardCategory::ActingAppointment => Some(ACTING),
                WizardCategory::Assignment => Some(ASSIGNMENT),
                WizardCategory::Disciplinary => None,
            }
        }

        /// Whether the settings counter editor applies to this category.
        pub fn shows_state_line(self) -> bool {
            self.skeleton().is_some_and(has_state_line)
        }
    }

    impl fmt::Display for WizardCategory {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /// Structured form state for one editing session.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct WizardForm {
        pub category: String,
        pub target_name: String,
        pub target_position: String,
        pub date_from: String,
        pub date_to: String,
        pub reason: String,
        pub is_penalty_free: bool,
        pub is_ochs: bool,
        pub ochs_point: String,
        pub ochs_reason: String,
        pub blacklist_days: String,
    }

    /// Commands delivered to the form from outside (e.g. a navigation link).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum WizardCommand {
        SwitchCategory(String),
        Reset,
    }

    impl WizardForm {
        pub fn new(category: WizardCategory) -> Self {
            Self {
                category: category.label().to_string(),
                ..Self::default()
            }
        }

        pub fn selected(&self) -> Option<WizardCategory> {
            WizardCategory::from_label(&self.category)
        }

        /// Every command resets the form; switching also changes the category.
        pub fn handle(&mut self, command: WizardCommand) {
            let category = match command {
                WizardCommand::SwitchCategory(category) => category,
                WizardCommand::Reset => std::mem::take(&mut self.category),
            };
            debug!(%category, "wizard form reset");
            *self = Self {
                category,
                ..Self::default()
            };
        }
    }

    /// Ban length in days: empty or unreadable input means the default, negatives clamp to zero.
    pub fn blacklist_days(raw: &str) -> u32 {
        let raw = raw.trim();
        if raw.is_empty() {
            return DEFAULT_BLACKLIST_DAYS;
        }
        match raw.parse::<i64>() {
            Ok(n) => n.clamp(0, i64::from(u32::MAX)) as u32,
            Err(_) => DEFAULT_BLACKLIST_DAYS,
        }
    }

    fn non_empty(value: &str) -> Option<String> {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn wizard_token(form: &WizardForm, key: &str) -> Option<String> {
        match key {
            "TARGET_NAME" => non_empty(&form.target_name),
            "TARGET_POSITION" => non_empty(&form.target_position),
            "DATE_FROM" => non_empty(&form.date_from).map(|d| format_date(&d)),
            "DATE_TO" => non_empty(&form.date_to).map(|d| format_date(&d)),
            "REASON" => {
                Some(non_empty(&form.reason).unwrap_or_else(|| DEFAULT_DISMISSAL_REASON.into()))
            }
            "PENALTY_CLAUSE" => Some(if form.is_penalty_free {
                PENALTY_FREE_CLAUSE.to_string()
            } else {
                String::new()
            }),
            "OCHS_POINT" => {
                Some(non_empty(&form.ochs_point).unwrap_or_else(|| DEFAULT_OCHS_POINT.into()))
            }
            "BLACKLIST_DAYS" => Some(blacklist_days(&form.blacklist_days).to_string()),
            "OCHS_REASON" => Some(
                non_empty(&form.ochs_reason)
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }

    /// Final document text for the form's category, or an empty string when the
    /// category is not recognized or there is nothing to render yet.
    pub fn generate(
        form: &WizardForm,
        disciplinary: &DisciplinaryBuilder,
        settings: &Settings,
    ) -> String {
        let Some(category) = form.selected() else {
            debug!(category = %form.category, "unhandled wizard category");
            return String::new();
        };
        match category {
            WizardCategory::Disciplinary => {
                let text = build_disciplinary_text(disciplinary);
                if text.is_empty() {
                    return text;
                }
                with_header(&text, settings)
            }
            WizardCategory::Dismissal if form.is_ochs => fill(BLACKLIST, form, settings),
            other => other
                .skeleton()
                .map(|skeleton| fill(skeleton, form, settings))
                .unwrap_or_default(),
        }
    }

    fn fill(skeleton: &str, form: &WizardForm, settings: &Settings) -> String {
        replace_in_content_with(skeleton, settings, |key| wizard_token(form, key))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::disciplinary::PersonPatch;
        use crate::substitution::build_header_line;

        fn settings() -> Settings {
            Settings {
                my_name: "Иванов".into(),
                target_name: "Запасной".into(),
                up: 2,
                p: 1,
                v: 0,
                ..Settings::default()
            }
        }

        fn form(category: WizardCategory) -> WizardForm {
            WizardForm {
                target_name: "Петров".into(),
                target_position: "Интерн".into(),
                ..WizardForm::new(category)
            }
        }

        fn render(form: &WizardForm) -> String {
            generate(form, &DisciplinaryBuilder::default(), &settings())
        }

        #[test]
        fn vacation_formats_dates_and_has_no_state_line() {
            let mut f = form(WizardCategory::Vacation);
            f.date_from = "2024-07-01".into();
            f.date_to = "2024-07-14".into();
            let out = render(&f);
            assert!(out.starts_with(&build_header_line(&settings())));
            assert!(out.contains("Петров, занимающему должность Интерн"));
            assert!(out.contains("с 01.07.2024 по 14.07.2024"));
            assert!(!out.contains("УП-"));
            assert!(!WizardCategory::Vacation.shows_state_line());
        }

        #[test]
        fn missing_inputs_stay_visible_or_fall_back_to_settings() {
            let mut f = WizardForm::new(WizardCategory::Vacation);
            f.date_from = "завтра".into();
            let out = render(&f);
            assert!(out.contains("Запасной, занимающему должность {TARGET_POSITION}"));
            assert!(out.contains("с завтра по {DATE_TO}"));
        }

        #[test]
        fn voluntary_dismissal_defaults_reason_and_gates_clause() {
            let mut f = form(WizardCategory::Dismissal);
            let out = render(&f);
            assert!(out.contains("увольняется по собственному желанию."));
            assert!(!out.contains(PENALTY_FREE_CLAUSE));
            assert!(out.contains("УП-2/5, П-1/5, В-0/3."));

            f.reason = "в связи с переездом".into();
            f.is_penalty_free = true;
            let out = render(&f);
            assert!(out.contains(&format!("увольняется в связи с переездом.{PENALTY_FREE_CLAUSE}")));
            assert!(WizardCategory::Dismissal.shows_state_line());
        }

        #[test]
        fn blacklist_dismissal_uses_defaults() {
            let mut f = form(WizardCategory::Dismissal);
            f.is_ochs = true;
            f.ochs_point = String::new();
            f.blacklist_days = String::new();
            let out = render(&f);
            assert!(out.contains(&format!("по пункту {DEFAULT_OCHS_POINT} сроком на 30 дней.")));

            f.ochs_point = "4.2".into();
            f.blacklist_days = "-10".into();
            f.ochs_reason = "прогулы".into();
            let out = render(&f);
            assert!(out.contains("по пункту 4.2 сроком на 0 дней (прогулы)."));
        }

        #[test]
        fn slot_filling_categories() {
            let cases = [
                (WizardCategory::Reception, "Петров принимается на должность Интерн."),
                (WizardCategory::Transfer, "Петров переводится на должность Интерн."),
                (WizardCategory::Assignment, "Петров назначается на должность Интерн."),
                (
                    WizardCategory::ActingAppointment,
                    "Петров назначается временно исполняющим обязанности Интерн.",
                ),
            ];
            for (category, expected) in cases {
                let out = render(&form(category));
                assert!(out.contains(expected), "{category}: {out}");
            }
        }

        #[test]
        fn typed_braces_are_not_expanded() {
            let mut f = form(WizardCategory::Dismissal);
            f.reason = "по причине {MY_NAME}".into();
            let out = render(&f);
            assert!(out.contains("увольняется по причине {MY_NAME}."));

            let mut builder = DisciplinaryBuilder::with_penalty("{CITY}");
            let i = builder.add_person();
            builder.update_person(
                i,
                PersonPatch {
                    name: Some("{TARGET_NAME}".into()),
                    ..PersonPatch::default()
                },
            );
            let f = WizardForm::new(WizardCategory::Disciplinary);
            let out = generate(&f, &builder, &settings());
            assert!(out.contains("{TARGET_NAME}, находясь в должности"));
            assert!(out.contains("в виде {CITY}"));
        }

        #[test]
        fn unknown_category_renders_nothing() {
            let f = WizardForm {
                category: "Неизвестно".into(),
                ..WizardForm::default()
            };
            assert_eq!(render(&f), "");
        }

        #[test]
        fn disciplinary_routes_to_builder() {
            let f = WizardForm::new(WizardCategory::Disciplinary);
            let mut builder = DisciplinaryBuilder::default();
            assert_eq!(generate(&f, &builder, &settings()), "");

            let i = builder.add_person();
            builder.update_person(
                i,
                PersonPatch {
                    name: Some("Сидоров".into()),
                    ..PersonPatch::default()
                },
            );
            let out = generate(&f, &builder, &settings());
            assert!(out.starts_with(&build_header_line(&settings())));
            assert!(out.contains("Сидоров, находясь в должности"));
        }

        #[test]
        fn switch_command_resets_form() {
            let mut f = form(WizardCategory::Vacation);
            f.handle(WizardCommand::SwitchCategory("Перевод".into()));
            assert_eq!(f, WizardForm::new(WizardCategory::Transfer));

            let mut g = form(WizardCategory::Dismissal);
            g.handle(WizardCommand::Reset);
            assert_eq!(g, WizardForm::new(WizardCategory::Dismissal));
        }

        #[test]
        fn labels_round_trip() {
            for c in WizardCategory::ALL {
                assert_eq!(WizardCategory::from_label(c.label()), Some(c));
            }
            assert_eq!(WizardCategory::from_label(" Прием "), Some(WizardCategory::Reception));
        }
    }
}

pub mod disciplinary {
    //! Multi-person disciplinary orders: one paragraph per person, a shared penalty.

    use crate::core::SubscriptionId;
    use crate::storage::{ChangeEvent, KeyValueStore, Storage};
    use crate::substitution::{COUNTER_MAX, V_MAX, clamp_counter};
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tracing::{debug, warn};

    pub const PENALTY_KEY: &str = "orders:disciplinary:penalty";
    pub const DISCIPLINARY_TITLE: &str = "Приказ о применении дисциплинарных взысканий";

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Person {
        pub name: String,
        pub position: String,
        pub up: u8,
        pub p: u8,
        pub v: u8,
        pub article: String,
        pub article_description: String,
        pub complaint_url: String,
    }

    impl Person {
        pub fn normalized(mut self) -> Self {
            self.up = self.up.min(COUNTER_MAX);
            self.p = self.p.min(COUNTER_MAX);
            self.v = self.v.min(V_MAX);
            self
        }

        fn merge(&mut self, patch: PersonPatch) {
            let PersonPatch {
                name,
                position,
                up,
                p,
                v,
                article,
                article_description,
                complaint_url,
            } = patch;
            if let Some(x) = name {
                self.name = x;
            }
            if let Some(x) = position {
                self.position = x;
            }
            if let Some(n) = up {
                self.up = clamp_counter(n, COUNTER_MAX);
            }
            if let Some(n) = p {
                self.p = clamp_counter(n, COUNTER_MAX);
            }
            if let Some(n) = v {
                self.v = clamp_counter(n, V_MAX);
            }
            if let Some(x) = article {
                self.article = x;
            }
            if let Some(x) = article_description {
                self.article_description = x;
            }
            if let Some(x) = complaint_url {
                self.complaint_url = x;
            }
        }

        pub fn paragraph(&self, penalty: &str) -> String {
            let mut out = format!(
                "{}, находясь в должности {} получает взыскание в виде {} и несёт ответственность по пункту {}",
                self.name, self.position, penalty, self.article
            );
            let description = self.article_description.trim();
            if !description.is_empty() {
                out.push_str(&format!(" ({description})"));
            }
            let complaint = self.complaint_url.trim();
            if !complaint.is_empty() {
                out.push_str("\nПо жалобе: ");
                out.push_str(complaint);
            }
            out.push_str(&format!(
                "\nУП-{}/5, П-{}/5, В-{}/3.",
                self.up, self.p, self.v
            ));
            out
        }
    }

    /// Partial update for one person; counters are clamped on merge.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct PersonPatch {
        pub name: Option<String>,
        pub position: Option<String>,
        pub up: Option<i64>,
        pub p: Option<i64>,
        pub v: Option<i64>,
        pub article: Option<String>,
        pub article_description: Option<String>,
        pub complaint_url: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DisciplinaryBuilder {
        pub penalty: String,
        pub people: Vec<Person>,
    }

    impl DisciplinaryBuilder {
        pub fn with_penalty(penalty: impl Into<String>) -> Self {
            Self {
                penalty: penalty.into(),
                people: vec![],
            }
        }

        /// Append a blank person; returns its index.
        pub fn add_person(&mut self) -> usize {
            self.people.push(Person::default());
            self.people.len() - 1
        }

        pub fn update_person(&mut self, index: usize, patch: PersonPatch) -> bool {
            match self.people.get_mut(index) {
                Some(person) => {
                    person.merge(patch);
                    true
                }
                None => {
                    debug!(index, "update for missing person ignored");
                    false
                }
            }
        }

        pub fn remove_person(&mut self, index: usize) -> Option<Person> {
            (index < self.people.len()).then(|| self.people.remove(index))
        }
    }

    /// Title plus one paragraph per person; empty when nobody has been added.
    pub fn build_disciplinary_text(builder: &DisciplinaryBuilder) -> String {
        if builder.people.is_empty() {
            return String::new();
        }
        let paragraphs: Vec<String> = builder
            .people
            .iter()
            .map(|person| person.paragraph(&builder.penalty))
            .collect();
        format!("{DISCIPLINARY_TITLE}\n\n{}", paragraphs.join("\n\n"))
    }

    fn load_penalty(kv: &dyn KeyValueStore) -> Option<String> {
        kv.get(PENALTY_KEY).unwrap_or_else(|err| {
            warn!(%err, "penalty unreadable");
            None
        })
    }

    /// A builder bound to storage: the penalty survives sessions and follows writes from
    /// other open drafts; people do not.
    #[derive(Debug)]
    pub struct DisciplinaryDraft {
        builder: Arc<RwLock<DisciplinaryBuilder>>,
        storage: Storage,
        subscription: SubscriptionId,
    }

    impl DisciplinaryDraft {
        pub fn open(storage: Storage) -> Self {
            let penalty = load_penalty(storage.kv.as_ref()).unwrap_or_default();
            let builder = Arc::new(RwLock::new(DisciplinaryBuilder::with_penalty(penalty)));
            let view = Arc::clone(&builder);
            let kv = Arc::clone(&storage.kv);
            let subscription = storage.bus.subscribe(move |event| {
                if *event == ChangeEvent::Penalty {
                    if let Some(penalty) = load_penalty(kv.as_ref()) {
                        view.write().penalty = penalty;
                    }
                }
            });
            Self {
                builder,
                storage,
                subscription,
            }
        }

        /// Snapshot of the current people and penalty.
        pub fn builder(&self) -> DisciplinaryBuilder {
            self.builder.read().clone()
        }

        pub fn add_person(&self) -> usize {
            self.builder.write().add_person()
        }

        pub fn update_person(&self, index: usize, patch: PersonPatch) -> bool {
            self.builder.write().update_person(index, patch)
        }

        pub fn remove_person(&self, index: usize) -> Option<Person> {
            self.builder.write().remove_person(index)
        }

        pub fn update_penalty(&self, text: &str) {
            self.builder.write().penalty = text.to_string();
            debug!("penalty updated");
            self.storage.persist(PENALTY_KEY, text, ChangeEvent::Penalty);
        }

        pub fn render(&self) -> String {
            build_disciplinary_text(&self.builder.read())
        }
    }

    impl Drop for DisciplinaryDraft {
        fn drop(&mut self) {
            self.storage.bus.unsubscribe(self.subscription);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn patch(name: &str, article: &str) -> PersonPatch {
            PersonPatch {
                name: Some(name.into()),
                position: Some("Интерн".into()),
                article: Some(article.into()),
                ..PersonPatch::default()
            }
        }

        #[test]
        fn nobody_means_no_document() {
            assert_eq!(build_disciplinary_text(&DisciplinaryBuilder::default()), "");
        }

        #[test]
        fn one_person_one_paragraph_one_state_line() {
            let mut b = DisciplinaryBuilder::with_penalty("выговора");
            let i = b.add_person();
            b.update_person(i, patch("Петров", "2.1"));
            let text = build_disciplinary_text(&b);

            assert_eq!(
                text,
                format!(
                    "{DISCIPLINARY_TITLE}\n\nПетров, находясь в должности Интерн получает взыскание в виде выговора и несёт ответственность по пункту 2.1\nУП-0/5, П-0/5, В-0/3."
                )
            );
            assert_eq!(text.matches("УП-").count(), 1);
        }

        #[test]
        fn optional_description_and_complaint() {
            let mut b = DisciplinaryBuilder::with_penalty("предупреждения");
            let i = b.add_person();
            b.update_person(
                i,
                PersonPatch {
                    article_description: Some("неуважение".into()),
                    complaint_url: Some(" https://forum/complaint/1 ".into()),
                    up: Some(9),
                    p: Some(-2),
                    v: Some(2),
                    ..patch("Петров", "3.3")
                },
            );
            let text = build_disciplinary_text(&b);
            assert!(text.contains("по пункту 3.3 (неуважение)\nПо жалобе: https://forum/complaint/1\nУП-5/5, П-0/5, В-2/3."));
        }

        #[test]
        fn paragraphs_are_separated_by_blank_lines() {
            let mut b = DisciplinaryBuilder::with_penalty("выговора");
            for (name, article) in [("А", "1"), ("Б", "2"), ("В", "3")] {
                let i = b.add_person();
                b.update_person(i, patch(name, article));
            }
            assert_eq!(b.remove_person(1).map(|p| p.name), Some("Б".to_string()));
            let text = build_disciplinary_text(&b);
            let blocks: Vec<&str> = text.split("\n\n").collect();
            assert_eq!(blocks.len(), 3);
            assert!(blocks[1].starts_with("А,"));
            assert!(blocks[2].starts_with("В,"));
        }

        #[test]
        fn out_of_range_indices_are_ignored() {
            let mut b = DisciplinaryBuilder::default();
            assert!(!b.update_person(0, PersonPatch::default()));
            assert_eq!(b.remove_person(3), None);
        }

        #[test]
        fn penalty_persists_but_people_do_not() {
            let storage = Storage::in_memory();
            let draft = DisciplinaryDraft::open(storage.clone());
            draft.update_penalty("строгого выговора");
            draft.add_person();

            let reopened = DisciplinaryDraft::open(storage);
            assert_eq!(reopened.builder().penalty, "строгого выговора");
            assert!(reopened.builder().people.is_empty());
        }

        #[test]
        fn open_drafts_converge_on_last_penalty() {
            let storage = Storage::in_memory();
            let a = DisciplinaryDraft::open(storage.clone());
            let b = DisciplinaryDraft::open(storage.clone());
            let i = b.add_person();
            b.update_person(i, patch("Петров", "2.1"));

            a.update_penalty("замечания");
            assert_eq!(b.builder().penalty, "замечания");
            assert!(b.render().contains("в виде замечания"));

            b.update_penalty("выговора");
            assert_eq!(a.builder().penalty, "выговора");
            assert_eq!(b.builder().people.len(), 1);
            assert!(a.builder().people.is_empty());
        }

        #[test]
        fn dropping_a_draft_unsubscribes_it() {
            let storage = Storage::in_memory();
            let draft = DisciplinaryDraft::open(storage.clone());
            assert_eq!(storage.bus.subscriber_count(), 1);
            drop(draft);
            assert_eq!(storage.bus.subscriber_count(), 0);
        }
    }
}

pub mod preview {
    //! The surface exposed to views: render a preview from either generation path and
    //! hand sanitized text to the clipboard.

    use crate::core::{FieldValues, Template};
    use crate::disciplinary::DisciplinaryBuilder;
    use crate::settings::Settings;
    use crate::storage::Clipboard;
    use crate::substitution::{apply_extra_fields, has_state_line, replace_in_content, sanitize_for_copy};
    use crate::wizard::{WizardForm, generate};
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Copy)]
    pub enum PreviewSource<'a> {
        Template {
            template: &'a Template,
            extra: &'a FieldValues,
        },
        Wizard {
            form: &'a WizardForm,
            disciplinary: &'a DisciplinaryBuilder,
        },
    }

    /// Settings tokens first (with header injection), then the template's own fields.
    pub fn render_template(template: &Template, settings: &Settings, extra: &FieldValues) -> String {
        let with_settings = replace_in_content(&template.body, settings);
        apply_extra_fields(&with_settings, template.builder.as_ref(), extra)
    }

    pub fn render_preview(source: PreviewSource<'_>, settings: &Settings) -> String {
        match source {
            PreviewSource::Template { template, extra } => render_template(template, settings, extra),
            PreviewSource::Wizard { form, disciplinary } => generate(form, disciplinary, settings),
        }
    }

    /// Whether the settings counter editor should be offered for `source`.
    pub fn shows_state_editor(source: PreviewSource<'_>) -> bool {
        match source {
            PreviewSource::Template { template, .. } => has_state_line(&template.body),
            PreviewSource::Wizard { form, .. } => form.selected().is_some_and(|c| c.shows_state_line()),
        }
    }

    /// Sanitize and write to the clipboard. Failures are logged, never raised.
    pub fn copy(clipboard: &dyn Clipboard, preview: &str) -> bool {
        let text = sanitize_for_copy(preview);
        match clipboard.write_text(&text) {
            Ok(()) => {
                debug!(chars = text.chars().count(), "copied preview");
                true
            }
            Err(err) => {
                warn!(%err, "clipboard write failed");
                false
            }
        }
    }

}

pub use catalog::TemplateCatalog;
pub use preview::{PreviewSource, copy, render_preview};
pub use settings::{SettingKey, Settings, SettingsStore};
pub use storage::Storage;
pub use substitution::{
    apply_extra_fields, build_header_line, has_state_line, replace_in_content, sanitize_for_copy,
};
