use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{Answer, Question, QuestionKind, RatingScale, Response, Survey};
use crate::preferences::is_rtl_text;
use crate::store::{generate_id, Flag, Store};

/// Seconds the thank-you screen stays up before the next respondent's form.
pub const COUNTDOWN_SECONDS: u8 = 5;

const SMILEYS_5: &[&str] = &["😞", "😕", "😐", "🙂", "😄"];
const SMILEYS_10: &[&str] = &["😡", "😠", "😞", "😕", "😐", "🙂", "😊", "😄", "😁", "🤩"];

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    fn plain(value: &str) -> Choice {
        Choice {
            value: value.into(),
            label: value.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InputView {
    TextInput,
    TextArea { rows: u8 },
    SingleChoice { choices: Vec<Choice> },
    MultiChoice { choices: Vec<Choice> },
    Rating { choices: Vec<Choice> },
    YesNo { choices: Vec<Choice> },
    DateInput,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct QuestionView {
    pub label: String,
    pub required: bool,
    pub name: String,
    pub input: InputView,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormView {
    pub survey_id: String,
    pub title: String,
    pub description: String,
    /// Set when the survey text is in a right-to-left script.
    pub rtl: bool,
    pub questions: Vec<QuestionView>,
}

/// Symbol shown for a rating value, or the number itself past the end of
/// the scale's table.
pub fn rating_label(scale: RatingScale, value: u8) -> String {
    let table = match scale {
        RatingScale::Five => SMILEYS_5,
        RatingScale::Ten => SMILEYS_10,
    };

    usize::from(value)
        .checked_sub(1)
        .and_then(|index| table.get(index))
        .map(|label| label.to_string())
        .unwrap_or_else(|| value.to_string())
}

pub fn render_question(question: &Question, index: usize) -> QuestionView {
    let input = match &question.kind {
        QuestionKind::Text => InputView::TextInput,
        QuestionKind::Textarea => InputView::TextArea { rows: 4 },
        QuestionKind::MultipleChoice { options } => InputView::SingleChoice {
            choices: options.iter().map(|o| Choice::plain(o)).collect(),
        },
        QuestionKind::Checkbox { options } => InputView::MultiChoice {
            choices: options.iter().map(|o| Choice::plain(o)).collect(),
        },
        QuestionKind::Rating { max_rating } => InputView::Rating {
            choices: (1..=max_rating.max())
                .map(|value| Choice {
                    value: value.to_string(),
                    label: rating_label(*max_rating, value),
                })
                .collect(),
        },
        QuestionKind::YesNo => InputView::YesNo {
            choices: vec![
                Choice {
                    value: "Yes".into(),
                    label: "👍 Yes".into(),
                },
                Choice {
                    value: "No".into(),
                    label: "👎 No".into(),
                },
            ],
        },
        QuestionKind::Date => InputView::DateInput,
    };

    QuestionView {
        label: format!("{}. {}", index + 1, question.question),
        required: question.required,
        name: question.field_name(),
        input,
    }
}

pub fn render_form(survey: &Survey) -> FormView {
    FormView {
        survey_id: survey.id.clone(),
        title: survey.title.clone(),
        description: survey.description.clone(),
        rtl: is_rtl_text(&survey.title) || is_rtl_text(&survey.description),
        questions: survey
            .questions
            .iter()
            .enumerate()
            .map(|(index, question)| render_question(question, index))
            .collect(),
    }
}

/// Submitted form fields, keyed by field name. A field may carry one value or
/// several. Numbers and booleans are kept as their text.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<String, Value>")]
pub struct FormData(BTreeMap<String, Answer>);

fn field_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

impl TryFrom<BTreeMap<String, Value>> for FormData {
    type Error = String;

    fn try_from(fields: BTreeMap<String, Value>) -> std::result::Result<FormData, String> {
        let mut form = BTreeMap::new();

        for (name, value) in fields {
            let answer = match value {
                Value::Null => continue,
                Value::Array(values) => values
                    .into_iter()
                    .map(field_text)
                    .collect::<Option<Vec<_>>>()
                    .map(Answer::Multiple),
                value => field_text(value).map(Answer::Single),
            };

            let answer =
                answer.ok_or_else(|| format!("field {} must be text or a number", name))?;
            form.insert(name, answer);
        }

        Ok(FormData(form))
    }
}

impl FormData {
    #[cfg(test)]
    pub fn new() -> FormData {
        FormData::default()
    }

    #[cfg(test)]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> FormData {
        let name = name.into();
        let value = value.into();

        let entry = match self.0.remove(&name) {
            None => Answer::Single(value),
            Some(Answer::Single(first)) => Answer::Multiple(vec![first, value]),
            Some(Answer::Multiple(mut values)) => {
                values.push(value);
                Answer::Multiple(values)
            }
        };
        self.0.insert(name, entry);
        self
    }

    /// First value of the field.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            Answer::Single(value) => Some(value.as_str()),
            Answer::Multiple(values) => values.first().map(|value| value.as_str()),
        }
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            None => Vec::new(),
            Some(Answer::Single(value)) => vec![value.clone()],
            Some(Answer::Multiple(values)) => values.clone(),
        }
    }
}

/// One answer per question: every checked value for checkbox questions, the
/// first value or an empty string for the rest. Required flags are not
/// re-checked here.
pub fn collect_answers(survey: &Survey, form: &FormData, submitted_at: DateTime<Utc>) -> Response {
    let answers = survey
        .questions
        .iter()
        .map(|question| {
            let name = question.field_name();
            let answer = match question.kind {
                QuestionKind::Checkbox { .. } => Answer::Multiple(form.get_all(&name)),
                _ => Answer::Single(form.get(&name).unwrap_or_default().to_string()),
            };
            (question.id.clone(), answer)
        })
        .collect();

    Response {
        id: generate_id(),
        survey_id: survey.id.clone(),
        submitted_at,
        answers,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KioskState {
    Selection,
    Form,
    ThankYou { remaining: u8 },
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SurveyChoice {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "view", rename_all = "camelCase")]
pub enum KioskView {
    Selection {
        surveys: Vec<SurveyChoice>,
        selected: Option<String>,
    },
    Form {
        form: FormView,
    },
    ThankYou {
        countdown: u8,
    },
}

/// What the kiosk is showing and which survey it is running.
#[derive(Clone, Debug, PartialEq)]
pub struct KioskSession {
    selected: Option<Survey>,
    state: KioskState,
}

impl KioskSession {
    pub fn new() -> KioskSession {
        KioskSession {
            selected: None,
            state: KioskState::Selection,
        }
    }

    /// Starts straight into the form when the persisted kiosk survey is still
    /// published.
    pub fn resume(store: &Store) -> KioskSession {
        let mut session = KioskSession::new();

        let survey = store
            .flag(Flag::KioskSurvey)
            .and_then(|id| store.survey(&id))
            .filter(|survey| survey.published);

        if let Some(survey) = survey {
            info!("Resuming kiosk survey {}", survey.id);
            session.selected = Some(survey);
            session.state = KioskState::Form;
        }

        session
    }

    #[cfg(test)]
    pub fn state(&self) -> KioskState {
        self.state
    }

    pub fn selected(&self) -> Option<&Survey> {
        self.selected.as_ref()
    }

    pub fn view(&self, store: &Store) -> KioskView {
        match (self.state, &self.selected) {
            (KioskState::Form, Some(survey)) => KioskView::Form {
                form: render_form(survey),
            },
            (KioskState::ThankYou { remaining }, _) => KioskView::ThankYou {
                countdown: remaining,
            },
            _ => KioskView::Selection {
                surveys: store
                    .published_surveys()
                    .into_iter()
                    .map(|survey| SurveyChoice {
                        id: survey.id,
                        title: survey.title,
                    })
                    .collect(),
                selected: self.selected.as_ref().map(|survey| survey.id.clone()),
            },
        }
    }

    /// Picks a published survey and remembers it for the next start-up.
    pub fn select(&mut self, store: &Store, id: &str) -> Result<()> {
        let survey = store
            .survey(id)
            .filter(|survey| survey.published)
            .ok_or_else(|| Error::NotFound(id.into()))?;

        store.set_flag(Flag::KioskSurvey, id)?;
        self.selected = Some(survey);
        Ok(())
    }

    /// Shows a blank form for the selected survey.
    pub fn start(&mut self) -> Result<()> {
        match &self.selected {
            Some(_) => {
                self.state = KioskState::Form;
                Ok(())
            }
            None => Err(Error::NotFound("no survey selected".into())),
        }
    }

    /// Throws away a half-filled form. The survey is fetched again so the
    /// blank form reflects any edits.
    pub fn restart(&mut self, store: &Store) -> Result<()> {
        if self.state != KioskState::Form || self.selected.is_none() {
            return Err(Error::NotFound("no survey in progress".into()));
        }

        self.reload(store);
        match self.state {
            KioskState::Form => Ok(()),
            _ => Err(Error::NotFound("survey is no longer available".into())),
        }
    }

    pub fn show_selection(&mut self) {
        self.selected = None;
        self.state = KioskState::Selection;
    }

    /// Stores one response and moves to the thank-you countdown. On a storage
    /// failure the form stays up for another try.
    pub fn submit(&mut self, store: &Store, form: &FormData) -> Result<Response> {
        let survey = match (self.state, &self.selected) {
            (KioskState::Form, Some(survey)) => survey,
            _ => return Err(Error::NotFound("no survey in progress".into())),
        };

        let response = collect_answers(survey, form, Utc::now());
        store.save_response(&response)?;
        info!("Response {} stored for survey {}", response.id, survey.id);

        self.state = KioskState::ThankYou {
            remaining: COUNTDOWN_SECONDS,
        };
        Ok(response)
    }

    /// Advances the countdown by one second. Returns true once there is
    /// nothing left to count.
    pub fn tick(&mut self, store: &Store) -> bool {
        match self.state {
            KioskState::ThankYou { remaining } if remaining > 1 => {
                self.state = KioskState::ThankYou {
                    remaining: remaining - 1,
                };
                false
            }
            KioskState::ThankYou { .. } => {
                self.reload(store);
                true
            }
            _ => true,
        }
    }

    /// Fetches the running survey again so edits made meanwhile show up. A
    /// survey that was deleted or unpublished sends the kiosk back to
    /// selection and forgets the kiosk pointer.
    pub fn reload(&mut self, store: &Store) {
        let id = match &self.selected {
            Some(survey) => survey.id.clone(),
            None => return self.show_selection(),
        };

        match store.survey(&id).filter(|survey| survey.published) {
            Some(survey) => {
                self.selected = Some(survey);
                self.state = KioskState::Form;
            }
            None => {
                warn!("Survey {} is no longer available", id);
                if let Err(err) = store.clear_flag(Flag::KioskSurvey) {
                    warn!("Couldn't clear kiosk survey: {}", err);
                }
                self.show_selection();
            }
        }
    }
}

impl Default for KioskSession {
    fn default() -> KioskSession {
        KioskSession::new()
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum AdminAccess {
    Granted,
    NeedsConfirmation,
    Cancelled,
    Denied,
}

/// Decides the kiosk's admin escape. Without a master password or a running
/// survey there is nothing to check and the operator only has to confirm.
pub fn admin_access(store: &Store, session: &KioskSession, password: Option<&str>) -> AdminAccess {
    if !store.has_master_password() && session.selected().is_none() {
        return AdminAccess::NeedsConfirmation;
    }

    let password = match password {
        Some(password) if !password.is_empty() => password,
        _ => return AdminAccess::Cancelled,
    };

    let survey_password = session.selected().and_then(|survey| survey.password());
    if store.verify_password(password, survey_password) {
        info!("Admin access granted");
        AdminAccess::Granted
    } else {
        warn!("Admin access denied");
        AdminAccess::Denied
    }
}

/// Shared kiosk session plus the timer that brings the form back after a
/// submission.
#[derive(Clone, Debug)]
pub struct KioskController {
    store: Store,
    session: Arc<Mutex<KioskSession>>,
    countdown: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl KioskController {
    pub fn new(store: Store) -> KioskController {
        let session = KioskSession::resume(&store);

        KioskController {
            store,
            session: Arc::new(Mutex::new(session)),
            countdown: Default::default(),
        }
    }

    pub async fn view(&self) -> KioskView {
        self.session.lock().await.view(&self.store)
    }

    pub async fn select(&self, id: &str) -> Result<KioskView> {
        let mut session = self.session.lock().await;
        session.select(&self.store, id)?;
        Ok(session.view(&self.store))
    }

    pub async fn start(&self) -> Result<KioskView> {
        let mut session = self.session.lock().await;
        session.start()?;
        Ok(session.view(&self.store))
    }

    pub async fn restart(&self) -> Result<KioskView> {
        let mut session = self.session.lock().await;
        session.restart(&self.store)?;
        Ok(session.view(&self.store))
    }

    pub async fn submit(&self, form: &FormData) -> Result<KioskView> {
        let view = {
            let mut session = self.session.lock().await;
            session.submit(&self.store, form)?;
            session.view(&self.store)
        };

        self.start_countdown().await;
        Ok(view)
    }

    pub async fn admin_access(&self, password: Option<&str>) -> AdminAccess {
        let session = self.session.lock().await;
        admin_access(&self.store, &session, password)
    }

    pub async fn active_survey(&self) -> Option<String> {
        let session = self.session.lock().await;
        session.selected().map(|survey| survey.id.clone())
    }

    /// Replaces any running countdown, so at most one is ever ticking.
    async fn start_countdown(&self) {
        let mut countdown = self.countdown.lock().await;
        if let Some(previous) = countdown.take() {
            previous.abort();
        }

        let session = self.session.clone();
        let store = self.store.clone();

        *countdown = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;

            loop {
                interval.tick().await;
                if session.lock().await.tick(&store) {
                    info!("Countdown elapsed");
                    break;
                }
            }
        }));
    }
}
