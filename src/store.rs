use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{
    error::ImportError,
    utils::now_ts,
    widget::{new_widget_id, Position, Theme, Widget, WidgetPatch},
};

/// Named JSON blobs in a local SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("SQLITE_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }

        // rusqlite::Connection is not Send/Sync; keep only the path and open
        // short-lived connections per operation.
        Ok(Self { path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS local_state (
  name TEXT PRIMARY KEY,
  json TEXT NOT NULL,
  updated_ts REAL
);
"#,
        )?;
        Ok(())
    }

    pub fn put_blob(&self, name: &str, json: &str, ts: f64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO local_state(name, json, updated_ts)
VALUES(?,?,?)
ON CONFLICT(name) DO UPDATE SET
  json=excluded.json,
  updated_ts=excluded.updated_ts
"#,
            params![name, json, ts],
        )?;
        Ok(())
    }

    pub fn get_blob(&self, name: &str) -> Result<Option<String>> {
        let conn = self.open_conn()?;
        let v = conn
            .query_row("SELECT json FROM local_state WHERE name = ?", params![name], |r| r.get(0))
            .optional()?;
        Ok(v)
    }
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub widgets: Vec<Widget>,
    #[serde(default)]
    pub theme: Theme,
}

/// Import file; both members are optional.
#[derive(Debug, Deserialize)]
struct ImportDoc {
    #[serde(default)]
    widgets: Option<Vec<Widget>>,
    #[serde(default)]
    theme: Option<Theme>,
}

/// Dashboard state held in memory and written through on every mutation.
#[derive(Clone)]
pub struct DashboardStore {
    db: SqliteStore,
    key: String,
    state: Arc<RwLock<PersistedState>>,
}

impl DashboardStore {
    /// Loads the blob named `key`. An unreadable blob is logged and replaced by
    /// an empty dashboard rather than failing startup.
    pub fn open(db: SqliteStore, key: &str) -> Result<Self> {
        db.init_db()?;
        let state = match db.get_blob(key)? {
            None => PersistedState::default(),
            Some(raw) => serde_json::from_str::<PersistedState>(&raw).unwrap_or_else(|e| {
                log::warn!("store.load.invalid key={} err={}", key, e);
                PersistedState::default()
            }),
        };
        log::info!("store.load key={} widgets={} theme={:?}", key, state.widgets.len(), state.theme);
        Ok(Self {
            db,
            key: key.to_string(),
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn path(&self) -> &str {
        self.db.path()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.read().clone()
    }

    pub fn widgets(&self) -> Vec<Widget> {
        self.state.read().widgets.clone()
    }

    pub fn widget(&self, id: &str) -> Option<Widget> {
        self.state.read().widgets.iter().find(|w| w.id == id).cloned()
    }

    pub fn theme(&self) -> Theme {
        self.state.read().theme
    }

    /// Applies `f` and persists the result; on a failed write the in-memory
    /// state is rolled back.
    fn mutate<T>(&self, f: impl FnOnce(&mut PersistedState) -> T) -> Result<T> {
        let mut guard = self.state.write();
        let before = guard.clone();
        let out = f(&mut *guard);
        if let Err(e) = self.persist(&*guard) {
            *guard = before;
            return Err(e);
        }
        Ok(out)
    }

    fn persist(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.db
            .put_blob(&self.key, &json, now_ts())
            .with_context(|| format!("persist dashboard state {}", self.key))
    }

    pub fn add_widget(&self, mut widget: Widget) -> Result<Widget> {
        widget.config.clamp_refresh();
        self.mutate(|s| {
            if widget.id.is_empty() || s.widgets.iter().any(|w| w.id == widget.id) {
                widget.id = fresh_id(&s.widgets.iter().map(|w| w.id.as_str()).collect());
            }
            s.widgets.push(widget.clone());
            widget
        })
    }

    pub fn remove_widget(&self, id: &str) -> Result<bool> {
        self.mutate(|s| {
            let before = s.widgets.len();
            s.widgets.retain(|w| w.id != id);
            s.widgets.len() != before
        })
    }

    pub fn update_widget(&self, id: &str, patch: WidgetPatch) -> Result<Option<Widget>> {
        self.mutate(|s| {
            let w = s.widgets.iter_mut().find(|w| w.id == id)?;
            patch.apply(w);
            Some(w.clone())
        })
    }

    pub fn update_widget_position(&self, id: &str, position: Position) -> Result<bool> {
        self.mutate(|s| match s.widgets.iter_mut().find(|w| w.id == id) {
            Some(w) => {
                w.position = position;
                true
            }
            None => false,
        })
    }

    /// Replaces the widget list. Missing or repeated ids get fresh ones.
    pub fn set_widgets(&self, mut widgets: Vec<Widget>) -> Result<Vec<Widget>> {
        admit(&mut widgets, &mut HashSet::new(), false);
        self.mutate(|s| {
            s.widgets = widgets;
            s.widgets.clone()
        })
    }

    pub fn set_theme(&self, theme: Theme) -> Result<()> {
        self.mutate(|s| s.theme = theme)
    }

    pub fn toggle_theme(&self) -> Result<Theme> {
        self.mutate(|s| {
            s.theme = s.theme.toggled();
            s.theme
        })
    }

    pub fn clear_dashboard(&self) -> Result<()> {
        self.mutate(|s| s.widgets.clear())
    }

    /// Pretty JSON of `{widgets, theme}` suitable for a download.
    pub fn export_config(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.state.read())?)
    }

    /// Loads an exported dashboard.
    ///
    /// Replace mode takes the file's widgets (or none) and theme (or dark).
    /// Merge mode appends the file's widgets under fresh ids and only takes
    /// its theme when present. Malformed input changes nothing.
    pub fn import_config(&self, text: &str, merge: bool) -> std::result::Result<PersistedState, ImportError> {
        let doc: ImportDoc = serde_json::from_str(text)?;
        let mut imported = doc.widgets.unwrap_or_default();

        let out = self.mutate(|s| {
            if merge {
                let mut taken: HashSet<String> = s.widgets.iter().map(|w| w.id.clone()).collect();
                admit(&mut imported, &mut taken, true);
                s.widgets.extend(imported);
                if let Some(theme) = doc.theme {
                    s.theme = theme;
                }
            } else {
                admit(&mut imported, &mut HashSet::new(), false);
                s.widgets = imported;
                s.theme = doc.theme.unwrap_or_default();
            }
            s.clone()
        })?;
        log::info!("store.import merge={} widgets={}", merge, out.widgets.len());
        Ok(out)
    }
}

/// Clamps refresh intervals and gives each widget an id not in `taken`.
/// Kept ids stay unless `renew` is set or they are empty or already taken.
fn admit(widgets: &mut [Widget], taken: &mut HashSet<String>, renew: bool) {
    for w in widgets.iter_mut() {
        w.config.clamp_refresh();
        if renew || w.id.is_empty() || taken.contains(&w.id) {
            w.id = fresh_id(&taken.iter().map(String::as_str).collect());
        }
        taken.insert(w.id.clone());
    }
}

fn fresh_id(taken: &HashSet<&str>) -> String {
    loop {
        let id = new_widget_id();
        if !taken.contains(id.as_str()) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::{WidgetConfig, WidgetKind, MIN_REFRESH_INTERVAL_MS};
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, DashboardStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let db = SqliteStore::new(path.to_str().unwrap()).unwrap();
        let store = DashboardStore::open(db, "finboard-storage").unwrap();
        (dir, store)
    }

    fn widget(title: &str) -> Widget {
        Widget::new(WidgetKind::Card, title, WidgetConfig::default())
    }

    #[test]
    fn test_empty_on_first_open() {
        let (_dir, store) = temp_store();
        assert_eq!(store.snapshot(), PersistedState::default());
        assert_eq!(store.theme(), Theme::Dark);
    }

    #[test]
    fn test_mutations_persist_across_reopen() {
        let (dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        let b = store.add_widget(widget("b")).unwrap();
        store.set_theme(Theme::Light).unwrap();
        assert!(store
            .update_widget_position(&a.id, Position { x: 1, y: 2, w: 3, h: 4 })
            .unwrap());
        assert!(store.remove_widget(&b.id).unwrap());
        assert!(!store.remove_widget("missing").unwrap());

        let db = SqliteStore::new(dir.path().join("state.sqlite").to_str().unwrap()).unwrap();
        let reopened = DashboardStore::open(db, "finboard-storage").unwrap();
        let snap = reopened.snapshot();
        assert_eq!(snap.theme, Theme::Light);
        assert_eq!(snap.widgets.len(), 1);
        assert_eq!(snap.widgets[0].id, a.id);
        assert_eq!(snap.widgets[0].position, Position { x: 1, y: 2, w: 3, h: 4 });
    }

    #[test]
    fn test_add_assigns_fresh_id_on_collision() {
        let (_dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        let mut dup = widget("dup");
        dup.id = a.id.clone();
        let added = store.add_widget(dup).unwrap();
        assert_ne!(added.id, a.id);
    }

    #[test]
    fn test_update_widget_clamps_interval() {
        let (_dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        let patch: WidgetPatch = serde_json::from_value(json!({"config": {"refreshInterval": 1}})).unwrap();
        let updated = store.update_widget(&a.id, patch).unwrap().unwrap();
        assert_eq!(updated.config.refresh_interval, Some(MIN_REFRESH_INTERVAL_MS));
        assert!(store.update_widget("nope", WidgetPatch::default()).unwrap().is_none());
    }

    #[test]
    fn test_toggle_and_clear() {
        let (_dir, store) = temp_store();
        store.add_widget(widget("a")).unwrap();
        assert_eq!(store.toggle_theme().unwrap(), Theme::Light);
        assert_eq!(store.toggle_theme().unwrap(), Theme::Dark);
        store.clear_dashboard().unwrap();
        assert!(store.widgets().is_empty());
    }

    #[test]
    fn test_export_then_replace_import() {
        let (_dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        store.set_theme(Theme::Light).unwrap();
        let exported = store.export_config().unwrap();
        assert!(exported.contains('\n'));

        store.clear_dashboard().unwrap();
        store.set_theme(Theme::Dark).unwrap();
        let state = store.import_config(&exported, false).unwrap();
        assert_eq!(state.widgets.len(), 1);
        assert_eq!(state.widgets[0].id, a.id);
        assert_eq!(state.theme, Theme::Light);
    }

    #[test]
    fn test_replace_import_defaults() {
        let (_dir, store) = temp_store();
        store.add_widget(widget("a")).unwrap();
        store.set_theme(Theme::Light).unwrap();
        let state = store.import_config("{}", false).unwrap();
        assert!(state.widgets.is_empty());
        assert_eq!(state.theme, Theme::Dark);
    }

    #[test]
    fn test_merge_import_keeps_ids_and_assigns_disjoint_ones() {
        let (_dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        let b = store.add_widget(widget("b")).unwrap();
        let existing: HashSet<String> = [a.id.clone(), b.id.clone()].into_iter().collect();

        let doc = json!({
            "widgets": [
                {"id": a.id, "type": "table", "title": "clash", "config": {"refreshInterval": 100}},
                {"id": "widget-x", "type": "chart", "title": "x"},
                {"id": "widget-x", "type": "chart", "title": "x again"}
            ]
        });
        let state = store.import_config(&doc.to_string(), true).unwrap();
        assert_eq!(state.widgets.len(), 5);
        assert_eq!(state.widgets[0].id, a.id);
        assert_eq!(state.widgets[1].id, b.id);
        assert_eq!(state.theme, Theme::Dark);

        let new_ids: Vec<&String> = state.widgets[2..].iter().map(|w| &w.id).collect();
        let unique: HashSet<&String> = new_ids.iter().copied().collect();
        assert_eq!(unique.len(), 3);
        assert!(new_ids.iter().all(|id| !existing.contains(*id)));
        assert_eq!(state.widgets[2].config.refresh_interval, Some(MIN_REFRESH_INTERVAL_MS));
    }

    #[test]
    fn test_import_accepts_missing_ids_and_partial_positions() {
        let (_dir, store) = temp_store();
        let doc = r#"{"widgets":[
            {"type":"card","title":"x","config":{"apiUrl":"http://q.test"}},
            {"type":"table","title":"y","position":{"x":2,"y":1}}
        ]}"#;
        let state = store.import_config(doc, true).unwrap();
        assert_eq!(state.widgets.len(), 2);
        assert!(state.widgets.iter().all(|w| w.id.starts_with("widget-")));
        assert_ne!(state.widgets[0].id, state.widgets[1].id);
        assert_eq!(state.widgets[0].position, Position::default());
        assert_eq!(state.widgets[1].position, Position { x: 2, y: 1, w: 4, h: 4 });

        let state = store.import_config(doc, false).unwrap();
        assert_eq!(state.widgets.len(), 2);
        assert!(state.widgets.iter().all(|w| !w.id.is_empty()));
    }

    #[test]
    fn test_set_widgets_fills_ids() {
        let (_dir, store) = temp_store();
        let a = store.add_widget(widget("a")).unwrap();
        let mut dup = widget("dup");
        dup.id = a.id.clone();
        let mut blank = widget("blank");
        blank.id.clear();
        let widgets = store.set_widgets(vec![a.clone(), dup, blank]).unwrap();
        assert_eq!(widgets[0].id, a.id);
        let ids: HashSet<&str> = widgets.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(""));
        assert_eq!(store.widgets(), widgets);
    }

    #[test]
    fn test_malformed_import_leaves_state_unchanged() {
        let (_dir, store) = temp_store();
        store.add_widget(widget("a")).unwrap();
        let before = store.snapshot();

        assert!(matches!(store.import_config("{nope", true), Err(ImportError::Parse(_))));
        assert!(store
            .import_config(r#"{"widgets": [{"title": "no id or type"}]}"#, false)
            .is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_corrupt_blob_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let db = SqliteStore::new(path.to_str().unwrap()).unwrap();
        db.init_db().unwrap();
        db.put_blob("finboard-storage", "not json", now_ts()).unwrap();
        let store = DashboardStore::open(db, "finboard-storage").unwrap();
        assert!(store.widgets().is_empty());
    }
}
