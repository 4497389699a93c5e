use anyhow::{Result, bail};
use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// --- Tables ---

/// Every entity table in the local store.
///
/// The response/list field names follow the server convention of wrapping
/// single entities as `{ "<singular>": {...} }` and lists as
/// `{ "<plural>": [...] }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    WeightEntries,
    Habits,
    HabitEntries,
    Todos,
    CalendarEvents,
    Exercises,
    Templates,
    WorkoutLogs,
    Friends,
    FriendRequests,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::WeightEntries,
        Table::Habits,
        Table::HabitEntries,
        Table::Todos,
        Table::CalendarEvents,
        Table::Exercises,
        Table::Templates,
        Table::WorkoutLogs,
        Table::Friends,
        Table::FriendRequests,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Table::WeightEntries => "weight_entries",
            Table::Habits => "habits",
            Table::HabitEntries => "habit_entries",
            Table::Todos => "todos",
            Table::CalendarEvents => "calendar_events",
            Table::Exercises => "exercises",
            Table::Templates => "templates",
            Table::WorkoutLogs => "workout_logs",
            Table::Friends => "friends",
            Table::FriendRequests => "friend_requests",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Field holding a single entity in a server response.
    #[must_use]
    pub fn response_field(self) -> &'static str {
        match self {
            Table::WeightEntries => "weightEntry",
            Table::Habits => "habit",
            Table::HabitEntries => "habitEntry",
            Table::Todos => "todo",
            Table::CalendarEvents => "event",
            Table::Exercises => "exercise",
            Table::Templates => "template",
            Table::WorkoutLogs => "workoutLog",
            Table::Friends => "friend",
            Table::FriendRequests => "friendRequest",
        }
    }

    /// Field holding the entity list in a server list response.
    #[must_use]
    pub fn list_field(self) -> &'static str {
        match self {
            Table::WeightEntries => "weightEntries",
            Table::Habits => "habits",
            Table::HabitEntries => "habitEntries",
            Table::Todos => "todos",
            Table::CalendarEvents => "events",
            Table::Exercises => "exercises",
            Table::Templates => "templates",
            Table::WorkoutLogs => "workoutLogs",
            Table::Friends => "friends",
            Table::FriendRequests => "friendRequests",
        }
    }

    /// Server-assigned primary key field. `None` for tables keyed by a
    /// natural key (date, or habit + date), which never get temp ids.
    #[must_use]
    pub fn id_field(self) -> Option<&'static str> {
        match self {
            Table::WeightEntries | Table::HabitEntries => None,
            Table::Habits => Some("habitId"),
            Table::Todos => Some("todoId"),
            Table::CalendarEvents => Some("eventId"),
            Table::Exercises => Some("exerciseId"),
            Table::Templates => Some("templateId"),
            Table::WorkoutLogs => Some("logId"),
            Table::Friends => Some("friendId"),
            Table::FriendRequests => Some("requestId"),
        }
    }

    /// Date-scoped history tables, subject to retention pruning.
    #[must_use]
    pub fn is_history(self) -> bool {
        matches!(
            self,
            Table::WeightEntries | Table::HabitEntries | Table::CalendarEvents | Table::WorkoutLogs
        )
    }

    /// Tables whose rows embed this table's id and must follow a temp id
    /// when it is reconciled: `(child table, field in child payload)`.
    #[must_use]
    pub fn dependents(self) -> &'static [(Table, &'static str)] {
        match self {
            Table::Habits => &[(Table::HabitEntries, "habitId")],
            Table::Templates => &[(Table::WorkoutLogs, "templateId")],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entity contract ---

/// A typed record cached in one of the entity tables.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const TABLE: Table;
    /// Collection path on the REST API, e.g. `/habits`.
    const ENDPOINT: &'static str;

    /// Natural key: exactly one row per key per table.
    fn cache_key(&self) -> String;

    /// Date used for range reads and retention pruning.
    fn date(&self) -> Option<NaiveDate> {
        None
    }

    fn list_path() -> String {
        Self::ENDPOINT.to_string()
    }

    fn create_path(&self) -> String {
        Self::ENDPOINT.to_string()
    }

    fn item_path(key: &str) -> String {
        format!("{}/{key}", Self::ENDPOINT)
    }

    /// Overwrite the server-assigned id. No-op for natural-key entities.
    fn assign_id(&mut self, _id: &str) {}
}

// --- Temp identifiers ---

pub const TEMP_ID_PREFIX: &str = "temp_";

/// Placeholder id for an entity created before the server has seen it.
#[must_use]
pub fn new_temp_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{TEMP_ID_PREFIX}{}_{}",
        Utc::now().timestamp_millis(),
        &random[..8]
    )
}

#[must_use]
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// --- Cached records ---

/// A record read back from the cache with its confirmation state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cached<T> {
    #[serde(flatten)]
    pub item: T,
    #[serde(rename = "_synced")]
    pub synced: bool,
}

impl<T> Cached<T> {
    pub fn confirmed(item: T) -> Self {
        Self { item, synced: true }
    }

    pub fn pending(item: T) -> Self {
        Self {
            item,
            synced: false,
        }
    }
}

// --- Entities ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightEntry {
    pub date: NaiveDate,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Entity for WeightEntry {
    const TABLE: Table = Table::WeightEntries;
    const ENDPOINT: &'static str = "/weight";

    fn cache_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    fn date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    #[serde(default)]
    pub habit_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl Entity for Habit {
    const TABLE: Table = Table::Habits;
    const ENDPOINT: &'static str = "/habits";

    fn cache_key(&self) -> String {
        self.habit_id.clone()
    }

    fn assign_id(&mut self, id: &str) {
        self.habit_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitEntry {
    pub habit_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl HabitEntry {
    #[must_use]
    pub fn key_for(habit_id: &str, date: NaiveDate) -> String {
        format!("{habit_id}:{}", date.format("%Y-%m-%d"))
    }
}

impl Entity for HabitEntry {
    const TABLE: Table = Table::HabitEntries;
    const ENDPOINT: &'static str = "/habits";

    fn cache_key(&self) -> String {
        Self::key_for(&self.habit_id, self.date)
    }

    fn date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }

    fn list_path() -> String {
        "/habits/entries".to_string()
    }

    fn create_path(&self) -> String {
        format!("/habits/{}/entries", self.habit_id)
    }

    // Composite key is `habitId:date`; the date never contains a colon.
    fn item_path(key: &str) -> String {
        match key.rsplit_once(':') {
            Some((habit_id, date)) => format!("/habits/{habit_id}/entries/{date}"),
            None => format!("/habits/entries/{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    #[serde(default)]
    pub todo_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Entity for Todo {
    const TABLE: Table = Table::Todos;
    const ENDPOINT: &'static str = "/todos";

    fn cache_key(&self) -> String {
        self.todo_id.clone()
    }

    fn date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    fn assign_id(&mut self, id: &str) {
        self.todo_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default)]
    pub event_id: String,
    pub title: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Entity for CalendarEvent {
    const TABLE: Table = Table::CalendarEvents;
    const ENDPOINT: &'static str = "/calendar/events";

    fn cache_key(&self) -> String {
        self.event_id.clone()
    }

    fn date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }

    fn assign_id(&mut self, id: &str) {
        self.event_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    #[serde(default)]
    pub exercise_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muscle_group: Option<String>,
}

impl Entity for Exercise {
    const TABLE: Table = Table::Exercises;
    const ENDPOINT: &'static str = "/workouts/exercises";

    fn cache_key(&self) -> String {
        self.exercise_id.clone()
    }

    fn assign_id(&mut self, id: &str) {
        self.exercise_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateExercise {
    pub exercise_id: String,
    #[serde(default)]
    pub sets: u32,
    #[serde(default)]
    pub reps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default)]
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub exercises: Vec<TemplateExercise>,
}

impl Entity for Template {
    const TABLE: Table = Table::Templates;
    const ENDPOINT: &'static str = "/workouts/templates";

    fn cache_key(&self) -> String {
        self.template_id.clone()
    }

    fn assign_id(&mut self, id: &str) {
        self.template_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedSet {
    pub reps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedExercise {
    pub exercise_id: String,
    #[serde(default)]
    pub sets: Vec<LoggedSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutLog {
    #[serde(default)]
    pub log_id: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub exercises: Vec<LoggedExercise>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for WorkoutLog {
    const TABLE: Table = Table::WorkoutLogs;
    const ENDPOINT: &'static str = "/workouts/logs";

    fn cache_key(&self) -> String {
        self.log_id.clone()
    }

    fn date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }

    fn assign_id(&mut self, id: &str) {
        self.log_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub friend_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Entity for Friend {
    const TABLE: Table = Table::Friends;
    const ENDPOINT: &'static str = "/friends";

    fn cache_key(&self) -> String {
        self.friend_id.clone()
    }

    fn assign_id(&mut self, id: &str) {
        self.friend_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    #[serde(default)]
    pub request_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_username: Option<String>,
    #[serde(default = "default_request_status")]
    pub status: String,
}

fn default_request_status() -> String {
    "pending".to_string()
}

impl Entity for FriendRequest {
    const TABLE: Table = Table::FriendRequests;
    const ENDPOINT: &'static str = "/friends/requests";

    fn cache_key(&self) -> String {
        self.request_id.clone()
    }

    fn assign_id(&mut self, id: &str) {
        self.request_id = id.to_string();
    }
}

// --- Edge validation for untyped payloads ---

/// A payload that passed through its table's typed record.
#[derive(Debug, Clone)]
pub struct TypedRow {
    pub key: String,
    pub date: Option<String>,
    pub data: String,
}

impl TypedRow {
    pub fn from_entity<T: Entity>(item: &T) -> Result<Self> {
        Ok(Self {
            key: item.cache_key(),
            date: item.date().map(|d| d.format("%Y-%m-%d").to_string()),
            data: serde_json::to_string(item)?,
        })
    }
}

fn typed<T: Entity>(value: &Value) -> Result<TypedRow> {
    let item: T = serde_json::from_value(value.clone())?;
    let row = TypedRow::from_entity(&item)?;
    if row.key.is_empty() {
        bail!("{} payload has no key", T::TABLE);
    }
    Ok(row)
}

/// Deserialize a raw server payload into the table's record type and back,
/// so only well-formed entities reach the cache.
pub fn typed_row(table: Table, value: &Value) -> Result<TypedRow> {
    match table {
        Table::WeightEntries => typed::<WeightEntry>(value),
        Table::Habits => typed::<Habit>(value),
        Table::HabitEntries => typed::<HabitEntry>(value),
        Table::Todos => typed::<Todo>(value),
        Table::CalendarEvents => typed::<CalendarEvent>(value),
        Table::Exercises => typed::<Exercise>(value),
        Table::Templates => typed::<Template>(value),
        Table::WorkoutLogs => typed::<WorkoutLog>(value),
        Table::Friends => typed::<Friend>(value),
        Table::FriendRequests => typed::<FriendRequest>(value),
    }
}

// --- Mutation queue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            _ => bail!("Unknown method '{s}'"),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Failed,
}

impl MutationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "failed" => Ok(MutationStatus::Failed),
            _ => bail!("Unknown mutation status '{s}'"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: i64,
    pub method: Method,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_table: Option<Table>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
    pub created_at: String,
    pub retries: u32,
    pub status: MutationStatus,
}

/// A write to replay once the device is back online.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
    pub entity_table: Option<Table>,
    pub entity_key: Option<String>,
    pub temp_id: Option<String>,
}

impl NewMutation {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            entity_table: None,
            entity_key: None,
            temp_id: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn for_entity(mut self, table: Table, key: impl Into<String>) -> Self {
        self.entity_table = Some(table);
        self.entity_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.as_str()), Some(table));
        }
        assert_eq!(Table::from_name("meal_entries"), None);
    }

    #[test]
    fn test_natural_key_tables_have_no_id_field() {
        assert!(Table::WeightEntries.id_field().is_none());
        assert!(Table::HabitEntries.id_field().is_none());
        assert_eq!(Table::Habits.id_field(), Some("habitId"));
        assert_eq!(Table::Habits.response_field(), "habit");
    }

    #[test]
    fn test_temp_id_shape() {
        let id = new_temp_id();
        assert!(is_temp_id(&id));
        assert_eq!(id.split('_').count(), 3);
        assert_ne!(id, new_temp_id());
        assert!(!is_temp_id("h_42"));
    }

    #[test]
    fn test_habit_entry_paths() {
        let entry = HabitEntry {
            habit_id: "h_1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            completed: true,
            value: None,
        };
        assert_eq!(entry.cache_key(), "h_1:2024-06-01");
        assert_eq!(entry.create_path(), "/habits/h_1/entries");
        assert_eq!(
            HabitEntry::item_path(&entry.cache_key()),
            "/habits/h_1/entries/2024-06-01"
        );
    }

    #[test]
    fn test_cached_serializes_synced_marker() {
        let habit = Habit {
            habit_id: "h_1".to_string(),
            name: "Read".to_string(),
            color: None,
            frequency: None,
            archived: false,
        };
        let value = serde_json::to_value(Cached::pending(habit)).unwrap();
        assert_eq!(value["habitId"], "h_1");
        assert_eq!(value["_synced"], false);
    }

    #[test]
    fn test_typed_row_rejects_malformed_payload() {
        assert!(typed_row(Table::WeightEntries, &json!({ "weight": 70.0 })).is_err());
        assert!(typed_row(Table::Habits, &json!({ "name": "Read" })).is_err());

        let row = typed_row(
            Table::WeightEntries,
            &json!({ "date": "2024-06-01", "weight": 72.5 }),
        )
        .unwrap();
        assert_eq!(row.key, "2024-06-01");
        assert_eq!(row.date.as_deref(), Some("2024-06-01"));
    }

    #[test]
    fn test_method_and_status_parse() {
        assert_eq!(Method::parse("PATCH").unwrap(), Method::Patch);
        assert!(Method::parse("PUT").is_err());
        assert_eq!(
            MutationStatus::parse("in_flight").unwrap(),
            MutationStatus::InFlight
        );
    }
}
