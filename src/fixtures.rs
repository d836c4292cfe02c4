use chrono::{DateTime, TimeZone, Utc};

use crate::models::{Answer, Question, QuestionKind, RatingScale, Response, Survey};

pub fn question(id: &str, kind: QuestionKind, text: &str) -> Question {
    Question {
        id: id.into(),
        kind,
        question: text.into(),
        required: false,
    }
}

/// One question of every kind, unpublished, no password.
pub fn survey(id: &str) -> Survey {
    let options = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();

    Survey {
        id: id.into(),
        title: "Visitor feedback".into(),
        description: "Tell us about your visit".into(),
        published: false,
        password: String::new(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
        questions: vec![
            question("name", QuestionKind::Text, "Your name?"),
            question(
                "colour",
                QuestionKind::MultipleChoice {
                    options: options(&["Red", "Green", "Blue"]),
                },
                "Favourite colour?",
            ),
            question(
                "extras",
                QuestionKind::Checkbox {
                    options: options(&["A", "B", "C"]),
                },
                "Which apply?",
            ),
            question(
                "score",
                QuestionKind::Rating {
                    max_rating: RatingScale::Five,
                },
                "How was it?",
            ),
            question("again", QuestionKind::YesNo, "Would you return?"),
            question("when", QuestionKind::Date, "Visit date?"),
            question("notes", QuestionKind::Textarea, "Comments"),
        ],
    }
}

pub fn at(timestamp: &str) -> DateTime<Utc> {
    timestamp.parse().unwrap()
}

pub fn response(id: &str, survey_id: &str, submitted_at: &str) -> Response {
    response_with(id, survey_id, submitted_at, &[])
}

pub fn response_with(
    id: &str,
    survey_id: &str,
    submitted_at: &str,
    answers: &[(&str, Answer)],
) -> Response {
    Response {
        id: id.into(),
        survey_id: survey_id.into(),
        submitted_at: at(submitted_at),
        answers: answers
            .iter()
            .map(|(question, answer)| (question.to_string(), answer.clone()))
            .collect(),
    }
}

pub fn single(value: &str) -> Answer {
    Answer::Single(value.into())
}

pub fn multiple(values: &[&str]) -> Answer {
    Answer::Multiple(values.iter().map(|v| v.to_string()).collect())
}
