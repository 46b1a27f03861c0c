//! Scan UI state and the pure reducer that advances it.
//!
//! Every transition builds a new snapshot from the previous one; the manager
//! publishes the result wholesale.

use crate::detection::FaceId;
use crate::events::{Outcome, ProcessedImage};

#[derive(Debug, Clone, Default)]
pub enum UiState {
    #[default]
    Initial,
    Loading,
    Success {
        images: Vec<ProcessedImage>,
        has_more: bool,
    },
    Error {
        message: String,
    },
}

impl UiState {
    pub fn images(&self) -> &[ProcessedImage] {
        match self {
            Self::Success { images, .. } => images,
            _ => &[],
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Reset,
    Started,
    /// A non-reset scan restarting after a failure, with the images shown before it.
    Resumed {
        images: Vec<ProcessedImage>,
        has_more: bool,
    },
    Found(Outcome),
    PageCommitted { has_more: bool },
    /// The stream ended without error, or paused at a page boundary.
    Completed { has_more: bool },
    Failed(String),
    Rename { face: FaceId, name: String },
}

pub fn reduce(state: &UiState, event: ScanEvent) -> UiState {
    match event {
        ScanEvent::Reset => UiState::Initial,
        ScanEvent::Started => match state {
            UiState::Initial | UiState::Error { .. } => UiState::Loading,
            other => other.clone(),
        },
        ScanEvent::Resumed { images, has_more } => match state {
            UiState::Error { .. } if !images.is_empty() => UiState::Success { images, has_more },
            _ => reduce(state, ScanEvent::Started),
        },
        ScanEvent::Found(outcome) => {
            let mut images = state.images().to_vec();
            images.push(outcome.image);
            UiState::Success {
                images,
                has_more: outcome.has_more,
            }
        }
        ScanEvent::PageCommitted { has_more } => match state {
            UiState::Success { images, .. } => UiState::Success {
                images: images.clone(),
                has_more,
            },
            other => other.clone(),
        },
        ScanEvent::Completed { has_more } => match state {
            UiState::Loading => UiState::Success {
                images: Vec::new(),
                has_more,
            },
            UiState::Success { images, .. } => UiState::Success {
                images: images.clone(),
                has_more,
            },
            other => other.clone(),
        },
        ScanEvent::Failed(message) => UiState::Error { message },
        ScanEvent::Rename { face, name } => rename(state, face, &name),
    }
}

fn rename(state: &UiState, face: FaceId, name: &str) -> UiState {
    let UiState::Success { images, has_more } = state else {
        return state.clone();
    };
    let images = images
        .iter()
        .map(|image| {
            let mut image = image.clone();
            if let Some(regions) = image.regions.as_mut() {
                for region in regions.iter_mut().filter(|r| r.id == face) {
                    region.name = name.to_owned();
                }
            }
            image
        })
        .collect();
    UiState::Success {
        images,
        has_more: *has_more,
    }
}
