use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tracing::info;

use crate::analytics::format_timestamp;
use crate::error::{Error, ImportError, Result};
use crate::models::{Question, Response, Survey};
use crate::store::{generate_id, Store};

pub const EXPORT_VERSION: &str = "1.0";

/// A file handed to the client to save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Download {
    pub content: String,
    pub filename: String,
    pub mime_type: &'static str,
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn filename(survey: &Survey, kind: &str, extension: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.{}",
        sanitize_filename(&survey.title),
        kind,
        now.format("%Y-%m-%d"),
        extension
    )
}

/// Every cell is quoted with inner quotes doubled. Commas and newlines inside
/// a cell are kept as they are.
pub fn responses_csv(
    survey: &Survey,
    responses: &[Response],
    offset: &FixedOffset,
) -> Result<String, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let header = ["Response ID", "Submitted At"]
        .iter()
        .map(|cell| cell.to_string())
        .chain(survey.questions.iter().map(|question| question.question.clone()))
        .collect::<Vec<_>>();
    writer.write_record(&header)?;

    for response in responses {
        let row = [
            response.id.clone(),
            format_timestamp(&response.submitted_at, offset),
        ]
        .into_iter()
        .chain(survey.questions.iter().map(|question| {
            response
                .answers
                .get(&question.id)
                .map(|answer| answer.join("; "))
                .unwrap_or_default()
        }))
        .collect::<Vec<_>>();
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;

    String::from_utf8(bytes)
        .map_err(|err| csv::Error::from(io::Error::new(io::ErrorKind::InvalidData, err)))
}

fn survey_with_responses(store: &Store, id: &str) -> Result<(Survey, Vec<Response>)> {
    let survey = store.survey(id).ok_or_else(|| Error::NotFound(id.into()))?;
    let responses = store.responses(id);

    if responses.is_empty() {
        return Err(Error::NoData);
    }

    Ok((survey, responses))
}

pub fn export_csv(
    store: &Store,
    id: &str,
    offset: &FixedOffset,
    now: DateTime<Utc>,
) -> Result<Download> {
    let (survey, responses) = survey_with_responses(store, id)?;

    Ok(Download {
        content: responses_csv(&survey, &responses, offset)?,
        filename: filename(&survey, "responses", "csv", now),
        mime_type: "text/csv",
    })
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SurveyOverview {
    pub id: String,
    pub title: String,
    pub description: String,
    pub questions: Vec<Question>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponsesExport {
    pub survey: SurveyOverview,
    pub responses: Vec<Response>,
    pub exported_at: DateTime<Utc>,
    pub total_responses: usize,
}

pub fn export_responses_json(store: &Store, id: &str, now: DateTime<Utc>) -> Result<Download> {
    let (survey, responses) = survey_with_responses(store, id)?;
    let filename = filename(&survey, "responses", "json", now);

    let export = ResponsesExport {
        total_responses: responses.len(),
        survey: SurveyOverview {
            id: survey.id,
            title: survey.title,
            description: survey.description,
            questions: survey.questions,
        },
        responses,
        exported_at: now,
    };

    Ok(Download {
        content: serde_json::to_string_pretty(&export)?,
        filename,
        mime_type: "application/json",
    })
}

/// The stored survey record as is, password and all.
pub fn export_survey_backup(store: &Store, id: &str, now: DateTime<Utc>) -> Result<Download> {
    let survey = store.survey(id).ok_or_else(|| Error::NotFound(id.into()))?;

    Ok(Download {
        content: serde_json::to_string_pretty(&survey)?,
        filename: filename(&survey, "survey", "json", now),
        mime_type: "application/json",
    })
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SurveyDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub questions: Vec<Question>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SurveyExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub survey: SurveyDefinition,
}

/// Portable survey definition. Id, password and published state are left out
/// so an import always starts as a fresh draft.
pub fn export_survey_definition(store: &Store, id: &str, now: DateTime<Utc>) -> Result<Download> {
    let survey = store.survey(id).ok_or_else(|| Error::NotFound(id.into()))?;
    let filename = filename(&survey, "export", "json", now);

    let export = SurveyExport {
        version: EXPORT_VERSION.into(),
        exported_at: now,
        survey: SurveyDefinition {
            title: survey.title,
            description: survey.description,
            questions: survey.questions,
        },
    };

    Ok(Download {
        content: serde_json::to_string_pretty(&export)?,
        filename,
        mime_type: "application/json",
    })
}

/// Creates a new unpublished survey from an exported definition. Survey and
/// question ids are always regenerated. Nothing is stored unless the whole
/// document checks out.
pub fn import_survey(store: &Store, raw: &str, now: DateTime<Utc>) -> Result<Survey, ImportError> {
    let document: Value = serde_json::from_str(raw).map_err(ImportError::Malformed)?;
    let definition = document.get("survey");

    let title = definition
        .and_then(|survey| survey.get("title"))
        .and_then(Value::as_str)
        .filter(|title| !title.is_empty())
        .ok_or(ImportError::MissingTitle)?;

    let questions = definition
        .and_then(|survey| survey.get("questions"))
        .and_then(Value::as_array)
        .filter(|questions| !questions.is_empty())
        .ok_or(ImportError::MissingQuestions)?;

    let questions = questions
        .iter()
        .map(|question| -> Result<Question, ImportError> {
            let mut question: Question =
                serde_json::from_value(question.clone()).map_err(ImportError::InvalidQuestion)?;
            question.id = generate_id();
            Ok(question)
        })
        .collect::<Result<Vec<_>, ImportError>>()?;

    let description = definition
        .and_then(|survey| survey.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let survey = Survey {
        id: generate_id(),
        title: format!("{} (Imported)", title),
        description: description.into(),
        published: false,
        password: String::new(),
        created_at: now,
        questions,
    };

    store.save_survey(&survey)?;
    info!("Survey {} imported as {}", survey.title, survey.id);

    Ok(survey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, multiple, single};
    use crate::models::QuestionKind;
    use chrono::Offset;
    use std::collections::HashSet;

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    fn now() -> DateTime<Utc> {
        fixtures::at("2024-03-04T12:00:00Z")
    }

    fn store_with_responses() -> Store {
        let store = Store::in_memory();
        store.save_survey(&fixtures::survey("s1")).unwrap();
        store
            .save_response(&fixtures::response_with(
                "r1",
                "s1",
                "2024-01-02T10:00:00Z",
                &[
                    ("name", single(r#"He said "hi""#)),
                    ("extras", multiple(&["A", "C"])),
                    ("notes", single("line one\nline, two")),
                ],
            ))
            .unwrap();
        store
    }

    #[test]
    fn sanitize_filename_replaces_non_alphanumerics() {
        assert_eq!(sanitize_filename("Visitor Feedback: 2024!"), "visitor_feedback__2024_");
        assert_eq!(sanitize_filename("استبيان"), "_______");
    }

    #[test]
    fn csv_quotes_every_cell_and_doubles_quotes() {
        let store = store_with_responses();
        let download = export_csv(&store, "s1", &utc(), now()).unwrap();

        assert_eq!(download.filename, "visitor_feedback_responses_2024-03-04.csv");
        assert_eq!(download.mime_type, "text/csv");

        let mut lines = download.content.splitn(2, '\n');
        assert_eq!(
            lines.next().unwrap(),
            r#""Response ID","Submitted At","Your name?","Favourite colour?","Which apply?","How was it?","Would you return?","Visit date?","Comments""#
        );
        assert_eq!(
            lines.next().unwrap(),
            "\"r1\",\"2024-01-02 10:00:00\",\"He said \"\"hi\"\"\",\"\",\"A; C\",\"\",\"\",\"\",\"line one\nline, two\"\n"
        );
    }

    #[test]
    fn csv_and_json_exports_need_responses() {
        let store = Store::in_memory();
        store.save_survey(&fixtures::survey("s1")).unwrap();

        assert!(matches!(export_csv(&store, "s1", &utc(), now()), Err(Error::NoData)));
        assert!(matches!(export_responses_json(&store, "s1", now()), Err(Error::NoData)));
        assert!(matches!(
            export_responses_json(&store, "missing", now()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn responses_json_carries_survey_and_count() {
        let store = store_with_responses();
        let download = export_responses_json(&store, "s1", now()).unwrap();
        let export: ResponsesExport = serde_json::from_str(&download.content).unwrap();

        assert_eq!(export.survey.id, "s1");
        assert_eq!(export.total_responses, 1);
        assert_eq!(export.responses, store.responses("s1"));
        assert_eq!(export.exported_at, now());

        let value: Value = serde_json::from_str(&download.content).unwrap();
        assert!(value["survey"].get("password").is_none());
        assert!(value.get("totalResponses").is_some());
    }

    #[test]
    fn definition_export_omits_id_password_and_published() {
        let store = Store::in_memory();
        let mut survey = fixtures::survey("s1");
        survey.password = "pw".into();
        survey.published = true;
        store.save_survey(&survey).unwrap();

        let download = export_survey_definition(&store, "s1", now()).unwrap();
        let value: Value = serde_json::from_str(&download.content).unwrap();

        assert_eq!(download.filename, "visitor_feedback_export_2024-03-04.json");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["survey"]["title"], "Visitor feedback");
        for omitted in &["id", "password", "published", "createdAt"] {
            assert!(value["survey"].get(omitted).is_none(), "{} leaked", omitted);
        }
    }

    #[test]
    fn backup_export_keeps_full_record() {
        let store = Store::in_memory();
        store.save_survey(&fixtures::survey("s1")).unwrap();

        let download = export_survey_backup(&store, "s1", now()).unwrap();
        let survey: Survey = serde_json::from_str(&download.content).unwrap();

        assert_eq!(survey, fixtures::survey("s1"));
        assert_eq!(download.filename, "visitor_feedback_survey_2024-03-04.json");
    }

    #[test]
    fn export_then_import_makes_fresh_draft() {
        let store = Store::in_memory();
        let mut original = fixtures::survey("s1");
        original.password = "pw".into();
        original.published = true;
        store.save_survey(&original).unwrap();

        let download = export_survey_definition(&store, "s1", now()).unwrap();
        let imported = import_survey(&store, &download.content, now()).unwrap();

        assert_ne!(imported.id, original.id);
        assert_eq!(imported.title, "Visitor feedback (Imported)");
        assert!(!imported.published);
        assert!(imported.password.is_empty());
        assert_eq!(imported.questions.len(), original.questions.len());
        for (new, old) in imported.questions.iter().zip(&original.questions) {
            assert_ne!(new.id, old.id);
            assert_eq!(new.kind, old.kind);
            assert_eq!(new.question, old.question);
            assert_eq!(new.required, old.required);
        }
        let ids = imported.questions.iter().map(|q| &q.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), imported.questions.len());
        assert_eq!(store.survey(&imported.id).unwrap(), imported);
    }

    #[test]
    fn import_accepts_questions_without_ids() {
        let store = Store::in_memory();
        let raw = r#"{"survey":{"title":"استبيان","questions":[
            {"type":"multipleChoice","question":"كيف؟","required":true,"options":["ممتاز","جيد"]},
            {"type":"yesNo","question":"هل؟"}
        ]}}"#;

        let survey = import_survey(&store, raw, now()).unwrap();

        assert_eq!(survey.title, "استبيان (Imported)");
        assert_eq!(survey.description, "");
        assert!(survey.questions.iter().all(|q| q.id.starts_with("id_")));
        assert_eq!(survey.questions[1].kind, QuestionKind::YesNo);
    }

    #[test]
    fn import_rejects_incomplete_documents_without_side_effects() {
        let store = Store::in_memory();

        let cases = vec![
            ("not json", "Malformed"),
            (r#"{"survey":{"questions":[{"type":"text","question":"Q"}]}}"#, "MissingTitle"),
            (r#"{"survey":{"title":"T"}}"#, "MissingQuestions"),
            (r#"{"survey":{"title":"T","questions":[]}}"#, "MissingQuestions"),
            (r#"{"survey":{"title":"T","questions":[{"type":"slider"}]}}"#, "InvalidQuestion"),
        ];

        for (raw, expected) in cases {
            let err = import_survey(&store, raw, now()).unwrap_err();
            let kind = match err {
                ImportError::Malformed(_) => "Malformed",
                ImportError::MissingTitle => "MissingTitle",
                ImportError::MissingQuestions => "MissingQuestions",
                ImportError::InvalidQuestion(_) => "InvalidQuestion",
                ImportError::Storage(_) => "Storage",
            };
            assert_eq!(kind, expected, "for {}", raw);
        }

        assert!(store.surveys().is_empty());
    }
}
