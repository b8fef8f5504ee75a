pub mod composition;
pub mod melody;
pub mod models;
pub mod progress;
pub mod selection;
pub mod tempo;
