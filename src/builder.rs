use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result, ValidationError};
use crate::models::{Question, QuestionKind, QuestionType, RatingScale, Survey};
use crate::store::{generate_id, Flag, Store};

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Up,
    Down,
}

/// Editing session over one survey. Edits stay in memory until [`SurveyEditor::save`].
#[derive(Clone, Debug, PartialEq)]
pub struct SurveyEditor {
    survey: Survey,
}

impl SurveyEditor {
    pub fn new() -> SurveyEditor {
        SurveyEditor {
            survey: Survey {
                id: generate_id(),
                title: String::new(),
                description: String::new(),
                published: false,
                password: String::new(),
                created_at: Utc::now(),
                questions: Vec::new(),
            },
        }
    }

    pub fn open(store: &Store, id: &str) -> Result<SurveyEditor> {
        store
            .survey(id)
            .map(SurveyEditor::from_survey)
            .ok_or_else(|| Error::NotFound(id.into()))
    }

    pub fn from_survey(survey: Survey) -> SurveyEditor {
        SurveyEditor { survey }
    }

    pub fn survey(&self) -> &Survey {
        &self.survey
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.survey.title = title.into();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.survey.description = description.into();
    }

    pub fn set_published(&mut self, published: bool) {
        self.survey.published = published;
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.survey.password = password.into();
    }

    fn question_mut(&mut self, index: usize) -> Result<&mut Question, ValidationError> {
        self.survey
            .questions
            .get_mut(index)
            .ok_or(ValidationError::QuestionOutOfRange { index })
    }

    fn options_mut(&mut self, index: usize) -> Result<&mut Vec<String>, ValidationError> {
        self.question_mut(index)?
            .kind
            .options_mut()
            .ok_or(ValidationError::NoOptions { index })
    }

    pub fn add_question(&mut self, tag: QuestionType) -> &Question {
        let question = Question::new(generate_id(), QuestionKind::with_defaults(tag));
        self.survey.questions.push(question);
        &self.survey.questions[self.survey.questions.len() - 1]
    }

    /// Replaces every question. Questions without an id get a fresh one.
    /// Choice questions need at least two options.
    pub fn set_questions(&mut self, questions: Vec<Question>) -> Result<(), ValidationError> {
        let too_few = questions.iter().any(|question| {
            question
                .kind
                .options()
                .map_or(false, |options| options.len() < 2)
        });
        if too_few {
            return Err(ValidationError::TooFewOptions);
        }

        self.survey.questions = questions
            .into_iter()
            .map(|mut question| {
                if question.id.is_empty() {
                    question.id = generate_id();
                }
                question
            })
            .collect();
        Ok(())
    }

    pub fn delete_question(&mut self, index: usize) -> Result<Question, ValidationError> {
        if index >= self.survey.questions.len() {
            return Err(ValidationError::QuestionOutOfRange { index });
        }
        Ok(self.survey.questions.remove(index))
    }

    /// Swaps the question with its neighbour. Returns false, changing nothing,
    /// when the neighbour doesn't exist.
    pub fn move_question(&mut self, index: usize, direction: Direction) -> bool {
        let target = match direction {
            Direction::Up => index.checked_sub(1),
            Direction::Down => index.checked_add(1),
        };

        let len = self.survey.questions.len();
        match target {
            Some(target) if index < len && target < len => {
                self.survey.questions.swap(index, target);
                true
            }
            _ => false,
        }
    }

    pub fn set_question_text(
        &mut self,
        index: usize,
        text: impl Into<String>,
    ) -> Result<(), ValidationError> {
        self.question_mut(index)?.question = text.into();
        Ok(())
    }

    pub fn set_required(&mut self, index: usize, required: bool) -> Result<(), ValidationError> {
        self.question_mut(index)?.required = required;
        Ok(())
    }

    pub fn set_rating_scale(
        &mut self,
        index: usize,
        scale: RatingScale,
    ) -> Result<(), ValidationError> {
        match &mut self.question_mut(index)?.kind {
            QuestionKind::Rating { max_rating } => {
                *max_rating = scale;
                Ok(())
            }
            _ => Err(ValidationError::NotRating { index }),
        }
    }

    /// Appends `Option N`, where N is the new option count.
    pub fn add_option(&mut self, index: usize) -> Result<&str, ValidationError> {
        let options = self.options_mut(index)?;
        options.push(format!("Option {}", options.len() + 1));
        Ok(options[options.len() - 1].as_str())
    }

    /// Option text is free-form; duplicates are allowed.
    pub fn set_option_text(
        &mut self,
        index: usize,
        option: usize,
        text: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let slot = self
            .options_mut(index)?
            .get_mut(option)
            .ok_or(ValidationError::OptionOutOfRange { index: option })?;
        *slot = text.into();
        Ok(())
    }

    /// Choice questions keep at least two options.
    pub fn remove_option(&mut self, index: usize, option: usize) -> Result<String, ValidationError> {
        let options = self.options_mut(index)?;

        if options.len() <= 2 {
            return Err(ValidationError::TooFewOptions);
        }
        if option >= options.len() {
            return Err(ValidationError::OptionOutOfRange { index: option });
        }

        Ok(options.remove(option))
    }

    /// Trims the survey fields, validates and persists. A rejected save leaves
    /// both the editor and the store untouched.
    pub fn save(&mut self, store: &Store) -> Result<&Survey> {
        let mut survey = self.survey.clone();
        survey.title = survey.title.trim().to_string();
        survey.description = survey.description.trim().to_string();
        survey.password = survey.password.trim().to_string();

        survey.validate()?;
        store.save_survey(&survey)?;

        info!("Survey {} saved ({} questions)", survey.id, survey.questions.len());

        self.survey = survey;
        Ok(&self.survey)
    }

    pub fn delete(self, store: &Store) -> Result<()> {
        delete_survey(store, &self.survey.id)
    }
}

/// A whole survey as submitted by the builder form. Without an id a new
/// survey is created.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SurveyDraft {
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub published: bool,
    pub password: String,
    pub questions: Vec<Question>,
}

pub fn save_draft(store: &Store, draft: SurveyDraft) -> Result<Survey> {
    let mut editor = match &draft.id {
        Some(id) => SurveyEditor::open(store, id)?,
        None => SurveyEditor::new(),
    };

    editor.set_title(draft.title);
    editor.set_description(draft.description);
    editor.set_published(draft.published);
    editor.set_password(draft.password);
    editor.set_questions(draft.questions)?;

    Ok(editor.save(store)?.clone())
}

/// Builder sessions in progress, keyed by survey id. Edits stay here until
/// the session is saved.
#[derive(Clone, Debug, Default)]
pub struct EditorSessions {
    open: Arc<Mutex<HashMap<String, SurveyEditor>>>,
}

impl EditorSessions {
    /// Starts editing a stored survey, or a new one when `id` is `None`.
    /// Reopening a survey drops its unsaved edits.
    pub async fn open(&self, store: &Store, id: Option<&str>) -> Result<Survey> {
        let editor = match id {
            Some(id) => SurveyEditor::open(store, id)?,
            None => SurveyEditor::new(),
        };

        let survey = editor.survey().clone();
        self.open.lock().await.insert(survey.id.clone(), editor);
        info!("Editing survey {}", survey.id);

        Ok(survey)
    }

    pub async fn draft(&self, id: &str) -> Result<Survey> {
        self.open
            .lock()
            .await
            .get(id)
            .map(|editor| editor.survey().clone())
            .ok_or_else(|| Error::NotFound(id.into()))
    }

    /// Applies one edit and returns the draft as it now stands.
    pub async fn edit<F>(&self, id: &str, edit: F) -> Result<Survey>
    where
        F: FnOnce(&mut SurveyEditor) -> Result<(), ValidationError>,
    {
        let mut open = self.open.lock().await;
        let editor = open
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.into()))?;

        edit(editor)?;
        Ok(editor.survey().clone())
    }

    /// Saves and closes the session. A rejected save keeps it open.
    pub async fn save(&self, store: &Store, id: &str) -> Result<Survey> {
        let mut open = self.open.lock().await;
        let editor = open
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.into()))?;

        let survey = editor.save(store)?.clone();
        open.remove(id);

        Ok(survey)
    }

    pub async fn discard(&self, id: &str) -> Result<()> {
        match self.open.lock().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(id.into())),
        }
    }
}

impl Default for SurveyEditor {
    fn default() -> SurveyEditor {
        SurveyEditor::new()
    }
}

pub fn delete_survey(store: &Store, id: &str) -> Result<()> {
    store.delete_survey(id)?;
    info!("Survey {} deleted with its responses", id);
    Ok(())
}

/// Copies the survey definition (not its responses) as a new unpublished draft.
pub fn duplicate_survey(store: &Store, id: &str) -> Result<Survey> {
    let survey = store.survey(id).ok_or_else(|| Error::NotFound(id.into()))?;

    let duplicate = Survey {
        id: generate_id(),
        title: format!("{} (Copy)", survey.title),
        published: false,
        created_at: Utc::now(),
        ..survey
    };

    store.save_survey(&duplicate)?;
    info!("Survey {} duplicated as {}", id, duplicate.id);

    Ok(duplicate)
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SurveyCard {
    pub id: String,
    pub title: String,
    pub description: String,
    pub published: bool,
    pub question_count: usize,
    pub created_at: DateTime<Utc>,
}

pub fn survey_cards(store: &Store) -> Vec<SurveyCard> {
    store
        .surveys()
        .into_iter()
        .map(|survey| SurveyCard {
            question_count: survey.questions.len(),
            id: survey.id,
            title: survey.title,
            description: survey.description,
            published: survey.published,
            created_at: survey.created_at,
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum MasterPasswordUpdate {
    Set,
    Unchanged,
    Removed,
}

/// A blank password keeps an existing master password, or removes the entry
/// when none is usable. Otherwise the confirmation must match exactly.
pub fn setup_master_password(
    store: &Store,
    password: &str,
    confirmation: &str,
) -> Result<MasterPasswordUpdate> {
    if password.trim().is_empty() {
        if store.master_password().is_some() {
            return Ok(MasterPasswordUpdate::Unchanged);
        }

        store.remove_master_password()?;
        return Ok(MasterPasswordUpdate::Removed);
    }

    if password != confirmation {
        return Err(ValidationError::PasswordMismatch.into());
    }

    store.set_master_password(password)?;
    info!("Master password set");

    Ok(MasterPasswordUpdate::Set)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum KioskSurveyStatus {
    Unset,
    Set { id: String, title: String },
    Missing { id: String },
}

/// Points kiosk mode at a published survey.
pub fn set_kiosk_survey(store: &Store, id: &str) -> Result<()> {
    match store.survey(id) {
        Some(survey) if survey.published => {
            store.set_flag(Flag::KioskSurvey, id)?;
            info!("Kiosk survey set to {}", id);
            Ok(())
        }
        _ => Err(Error::NotFound(id.into())),
    }
}

pub fn clear_kiosk_survey(store: &Store) -> Result<()> {
    store.clear_flag(Flag::KioskSurvey)?;
    Ok(())
}

pub fn kiosk_survey_status(store: &Store) -> KioskSurveyStatus {
    match store.flag(Flag::KioskSurvey) {
        None => KioskSurveyStatus::Unset,
        Some(id) => match store.survey(&id) {
            Some(survey) => KioskSurveyStatus::Set {
                id,
                title: survey.title,
            },
            None => KioskSurveyStatus::Missing { id },
        },
    }
}
