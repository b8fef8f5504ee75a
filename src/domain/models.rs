use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = 3;
pub const DEFAULT_ESTIMATED_MINUTES: u32 = 15;
pub const MAX_ENERGY_BOOST: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tempo {
    Allegro,
    #[default]
    Moderato,
    Adagio,
}

impl Tempo {
    /// Declaration order; also the tie-break order for dominant tempo.
    pub const ALL: [Tempo; 3] = [Tempo::Allegro, Tempo::Moderato, Tempo::Adagio];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allegro => "allegro",
            Self::Moderato => "moderato",
            Self::Adagio => "adagio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allegro" => Some(Self::Allegro),
            "moderato" => Some(Self::Moderato),
            "adagio" => Some(Self::Adagio),
            _ => None,
        }
    }

    /// Lower is gentler: adagio first, allegro last.
    pub fn gentleness_rank(self) -> u8 {
        match self {
            Self::Adagio => 0,
            Self::Moderato => 1,
            Self::Allegro => 2,
        }
    }

    pub fn for_energy(level: u8) -> Self {
        if level >= 7 {
            Self::Allegro
        } else if level >= 4 {
            Self::Moderato
        } else {
            Self::Adagio
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempoFilter {
    #[default]
    All,
    Only(Tempo),
}

impl TempoFilter {
    pub fn parse(value: &str) -> Option<Self> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Some(Self::All);
        }
        Tempo::parse(value).map(Self::Only)
    }

    pub fn matches(self, tempo: Tempo) -> bool {
        match self {
            Self::All => true,
            Self::Only(expected) => expected == tempo,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Symphony,
    Ensemble,
    #[default]
    Solo,
}

impl MovementType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Symphony => "Symphony",
            Self::Ensemble => "Ensemble",
            Self::Solo => "Solo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "symphony" => Some(Self::Symphony),
            "ensemble" => Some(Self::Ensemble),
            "solo" => Some(Self::Solo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tempo_required: Tempo,
    pub completed: bool,
    #[serde(default)]
    pub movement_id: Option<String>,
    pub priority: u8,
    pub estimated_minutes: u32,
    pub energy_boost: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.title, "task.title")?;
        validate_priority(self.priority, "task.priority")?;
        validate_minutes(self.estimated_minutes, "task.estimated_minutes")?;
        if self.completed != self.completed_at.is_some() {
            return Err("task.completed_at must be set exactly when task.completed".to_string());
        }
        Ok(())
    }

    pub fn belongs_to(&self, movement_id: &str) -> bool {
        self.movement_id.as_deref() == Some(movement_id)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_incomplete(&mut self, now: DateTime<Utc>) {
        self.completed = false;
        self.completed_at = None;
        self.updated_at = now;
    }

    pub fn refresh_energy_boost(&mut self) {
        self.energy_boost = energy_boost(self.priority, self.estimated_minutes);
    }
}

/// Reward for completing a task: urgency plus one point per started quarter hour.
pub fn energy_boost(priority: u8, estimated_minutes: u32) -> u32 {
    let priority_boost = 6u32.saturating_sub(u32::from(priority)).max(1);
    let time_boost = estimated_minutes.div_ceil(15);
    (priority_boost + time_boost).min(MAX_ENERGY_BOOST)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub tempo_required: Tempo,
    pub priority: u8,
    pub estimated_minutes: u32,
    pub movement_id: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, tempo_required: Tempo) -> Self {
        Self {
            title: title.into(),
            description: None,
            tempo_required,
            priority: DEFAULT_PRIORITY,
            estimated_minutes: DEFAULT_ESTIMATED_MINUTES,
            movement_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_minutes(mut self, estimated_minutes: u32) -> Self {
        self.estimated_minutes = estimated_minutes;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn in_movement(mut self, movement_id: impl Into<String>) -> Self {
        self.movement_id = Some(movement_id.into());
        self
    }
}

/// Partial task edit. `None` leaves a field untouched; for nullable fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub tempo_required: Option<Tempo>,
    pub priority: Option<u8>,
    pub estimated_minutes: Option<u32>,
    pub movement_id: Option<Option<String>>,
    pub completed: Option<bool>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn changes_energy_boost(&self) -> bool {
        self.priority.is_some() || self.estimated_minutes.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Movement {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    #[serde(default)]
    pub ensemble_members: Vec<String>,
    pub color_theme: String,
    #[serde(default)]
    pub template_category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Movement {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "movement.id")?;
        validate_non_empty(&self.name, "movement.name")?;
        validate_non_empty(&self.color_theme, "movement.color_theme")?;
        if self.movement_type != MovementType::Ensemble && !self.ensemble_members.is_empty() {
            return Err("movement.ensemble_members requires type ensemble".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub name: String,
    pub description: Option<String>,
    pub movement_type: MovementType,
    pub color_theme: String,
    pub template_category: Option<String>,
}

impl NewMovement {
    pub fn new(name: impl Into<String>, movement_type: MovementType) -> Self {
        Self {
            name: name.into(),
            description: None,
            movement_type,
            color_theme: DEFAULT_MOVEMENT_COLOR.to_string(),
            template_category: None,
        }
    }
}

pub const DEFAULT_MOVEMENT_COLOR: &str = "#4ecdc4";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub movement_type: Option<MovementType>,
    pub color_theme: Option<String>,
    pub template_category: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MovementTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub movement_type: MovementType,
    pub color_theme: &'static str,
    pub template_category: &'static str,
    pub suggested_tasks: &'static [&'static str],
}

impl MovementTemplate {
    pub fn to_new_movement(&self) -> NewMovement {
        NewMovement {
            name: self.name.to_string(),
            description: Some(self.description.to_string()),
            movement_type: self.movement_type,
            color_theme: self.color_theme.to_string(),
            template_category: Some(self.template_category.to_string()),
        }
    }
}

pub const MOVEMENT_TEMPLATES: &[MovementTemplate] = &[
    MovementTemplate {
        name: "Shopping Symphony",
        description: "Organize your shopping lists and store visits",
        movement_type: MovementType::Solo,
        color_theme: "#4ade80",
        template_category: "daily_life",
        suggested_tasks: &[
            "Create grocery list",
            "Check store hours",
            "Gather reusable bags",
            "Review weekly meal plan",
        ],
    },
    MovementTemplate {
        name: "Errands Ensemble",
        description: "Coordinate multiple errands and appointments",
        movement_type: MovementType::Ensemble,
        color_theme: "#3b82f6",
        template_category: "daily_life",
        suggested_tasks: &[
            "Schedule appointments",
            "Plan efficient route",
            "Gather required documents",
            "Check business hours",
        ],
    },
    MovementTemplate {
        name: "Project Concerto",
        description: "Break down complex projects into manageable pieces",
        movement_type: MovementType::Symphony,
        color_theme: "#8b5cf6",
        template_category: "work",
        suggested_tasks: &[
            "Define project scope",
            "Create timeline",
            "Identify key milestones",
            "Set up project files",
        ],
    },
    MovementTemplate {
        name: "Morning Overture",
        description: "Start your day with a harmonious routine",
        movement_type: MovementType::Solo,
        color_theme: "#f59e0b",
        template_category: "routine",
        suggested_tasks: &[
            "Morning meditation",
            "Review daily priorities",
            "Check weather forecast",
            "Prepare healthy breakfast",
        ],
    },
    MovementTemplate {
        name: "Evening Sonata",
        description: "Wind down peacefully with evening tasks",
        movement_type: MovementType::Solo,
        color_theme: "#6366f1",
        template_category: "routine",
        suggested_tasks: &[
            "Reflect on daily wins",
            "Prepare for tomorrow",
            "Relaxation activity",
            "Set sleep environment",
        ],
    },
    MovementTemplate {
        name: "Health Harmony",
        description: "Keep your wellness activities in perfect rhythm",
        movement_type: MovementType::Solo,
        color_theme: "#10b981",
        template_category: "health",
        suggested_tasks: &[
            "Schedule health appointments",
            "Plan workout routine",
            "Track daily medications",
            "Meal prep planning",
        ],
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Melody {
    pub id: String,
    pub content: String,
    pub is_voice: bool,
    pub processed: bool,
    #[serde(default)]
    pub processing_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Melody {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "melody.id")?;
        validate_non_empty(&self.content, "melody.content")?;
        if self.processed != self.processed_at.is_some() {
            return Err("melody.processed_at must be set exactly when melody.processed".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TempoHistoryEntry {
    pub id: String,
    pub tempo: Tempo,
    #[serde(default)]
    pub previous_tempo: Option<Tempo>,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

pub fn validate_priority(value: u8, field_name: &str) -> Result<(), String> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
        return Err(format!(
            "{field_name} must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
        ));
    }
    Ok(())
}

pub fn validate_minutes(value: u32, field_name: &str) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{field_name} must be > 0"));
    }
    Ok(())
}

/// Trims the value and maps blank strings to `None`.
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}
