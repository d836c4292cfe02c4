use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::error;
use warp::{
    http,
    reject::{self, Rejection},
    reply::{self, Reply},
    Filter,
};

use crate::analytics::DateFilter;
use crate::builder::{self, Direction, SurveyDraft, SurveyEditor};
use crate::controllers::{AdminRequest, SurveyController};
use crate::error::{Error, Result};
use crate::export::{self, Download};
use crate::filters::{self, Unauthorized};
use crate::kiosk::{FormData, SurveyChoice};
use crate::models::{QuestionType, RatingScale};
use crate::preferences::Preferences;
use crate::store::Store;

/// Largest accepted request body, matching the default store quota.
const BODY_LIMIT: u64 = 5 * 1024 * 1024;

#[derive(Clone, Debug, Serialize)]
struct ErrorReply {
    error: &'static str,
    message: String,
}

#[derive(Clone, Debug, Deserialize)]
struct MasterPasswordRequest {
    #[serde(default)]
    password: String,
    #[serde(default)]
    confirmation: String,
}

#[derive(Clone, Debug, Deserialize)]
struct KioskSurveyRequest {
    id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PreferencesRequest {
    language: Option<String>,
    toggle_direction: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct OpenEditorRequest {
    id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct SurveyDetailsRequest {
    title: Option<String>,
    description: Option<String>,
    published: Option<bool>,
    password: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct AddQuestionRequest {
    #[serde(rename = "type")]
    kind: QuestionType,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct QuestionRequest {
    question: Option<String>,
    required: Option<bool>,
    max_rating: Option<RatingScale>,
}

#[derive(Clone, Debug, Deserialize)]
struct MoveRequest {
    direction: Direction,
}

#[derive(Clone, Debug, Deserialize)]
struct OptionTextRequest {
    text: String,
}

#[derive(Clone, Debug, Serialize)]
struct Deleted {
    deleted: String,
}

#[derive(Clone, Debug, Serialize)]
struct Cleared {
    removed: usize,
}

fn status(err: &Error) -> http::StatusCode {
    match err {
        Error::Validation(_) | Error::Import(_) => http::StatusCode::BAD_REQUEST,
        Error::Unauthorized => http::StatusCode::UNAUTHORIZED,
        Error::NotFound(_) | Error::NoData => http::StatusCode::NOT_FOUND,
        Error::Storage(_) => http::StatusCode::INSUFFICIENT_STORAGE,
        Error::Csv(_) | Error::Json(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &Error) -> reply::Response {
    let status = status(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }

    let reply = ErrorReply {
        error: err.code(),
        message: err.to_string(),
    };

    reply::with_status(reply::json(&reply), status).into_response()
}

fn json_reply<T: Serialize>(result: Result<T>) -> reply::Response {
    match result {
        Ok(value) => reply::json(&value).into_response(),
        Err(err) => error_reply(&err),
    }
}

fn download_reply(result: Result<Download>) -> reply::Response {
    match result {
        Ok(download) => {
            let disposition = format!("attachment; filename=\"{}\"", download.filename);
            let reply = reply::with_header(download.content, "Content-Type", download.mime_type);
            reply::with_header(reply, "Content-Disposition", disposition).into_response()
        }
        Err(err) => error_reply(&err),
    }
}

fn update_preferences(store: &Store, request: &PreferencesRequest) -> Result<Preferences> {
    if let Some(language) = &request.language {
        Preferences::set_language(store, language)?;
    }
    if request.toggle_direction {
        Preferences::toggle_direction(store)?;
    }
    Ok(Preferences::load(store))
}

fn surveys(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let admin = filters::admin(controller.clone());
    let with_controller = filters::with_controller(controller);

    let list = warp::path!("surveys")
        .and(warp::get())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            reply::json(&builder::survey_cards(controller.store())).into_response()
        });

    let save = warp::path!("surveys")
        .and(warp::post())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .map(|draft: SurveyDraft, controller: SurveyController| {
            json_reply(builder::save_draft(controller.store(), draft))
        });

    let get = warp::path!("surveys" / String)
        .and(warp::get())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|id: String, controller: SurveyController| {
            json_reply(
                controller
                    .store()
                    .survey(&id)
                    .ok_or(Error::NotFound(id)),
            )
        });

    let delete = warp::path!("surveys" / String)
        .and(warp::delete())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|id: String, controller: SurveyController| {
            let store = controller.store();
            let result = SurveyEditor::open(store, &id)
                .and_then(|editor| editor.delete(store))
                .map(|()| Deleted { deleted: id });
            json_reply(result)
        });

    let duplicate = warp::path!("surveys" / String / "duplicate")
        .and(warp::post())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|id: String, controller: SurveyController| {
            json_reply(builder::duplicate_survey(controller.store(), &id))
        });

    let clear_responses = warp::path!("surveys" / String / "responses")
        .and(warp::delete())
        .and(admin)
        .and(with_controller)
        .map(|id: String, controller: SurveyController| {
            let result = match controller.store().survey(&id) {
                None => Err(Error::NotFound(id)),
                Some(_) => controller
                    .store()
                    .delete_responses(&id)
                    .map(|()| Deleted { deleted: id })
                    .map_err(Error::from),
            };
            json_reply(result)
        });

    list.or(save)
        .or(get)
        .or(delete)
        .or(duplicate)
        .or(clear_responses)
}

/// Builder sessions: one edit per request, persisted only on save.
fn editor(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let admin = filters::admin(controller.clone());
    let with_controller = filters::with_controller(controller);

    let open = warp::path!("editor")
        .and(warp::post())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(|request: OpenEditorRequest, controller: SurveyController| async move {
            let draft = controller
                .editors()
                .open(controller.store(), request.id.as_deref())
                .await;
            Ok::<_, Rejection>(json_reply(draft))
        });

    let draft = warp::path!("editor" / String)
        .and(warp::get())
        .and(admin.clone())
        .and(with_controller.clone())
        .and_then(|id: String, controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.editors().draft(&id).await))
        });

    let details = warp::path!("editor" / String)
        .and(warp::put())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(
            |id: String, request: SurveyDetailsRequest, controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| {
                        if let Some(title) = request.title {
                            editor.set_title(title);
                        }
                        if let Some(description) = request.description {
                            editor.set_description(description);
                        }
                        if let Some(published) = request.published {
                            editor.set_published(published);
                        }
                        if let Some(password) = request.password {
                            editor.set_password(password);
                        }
                        Ok(())
                    })
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    let add_question = warp::path!("editor" / String / "questions")
        .and(warp::post())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(
            |id: String, request: AddQuestionRequest, controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| {
                        editor.add_question(request.kind);
                        Ok(())
                    })
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    // The scale goes first so a rejected edit changes nothing.
    let update_question = warp::path!("editor" / String / "questions" / usize)
        .and(warp::put())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(
            |id: String, index: usize, request: QuestionRequest, controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| {
                        if let Some(scale) = request.max_rating {
                            editor.set_rating_scale(index, scale)?;
                        }
                        if let Some(text) = request.question {
                            editor.set_question_text(index, text)?;
                        }
                        if let Some(required) = request.required {
                            editor.set_required(index, required)?;
                        }
                        Ok(())
                    })
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    let delete_question = warp::path!("editor" / String / "questions" / usize)
        .and(warp::delete())
        .and(admin.clone())
        .and(with_controller.clone())
        .and_then(|id: String, index: usize, controller: SurveyController| async move {
            let draft = controller
                .editors()
                .edit(&id, |editor| editor.delete_question(index).map(drop))
                .await;
            Ok::<_, Rejection>(json_reply(draft))
        });

    let move_question = warp::path!("editor" / String / "questions" / usize / "move")
        .and(warp::post())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(
            |id: String, index: usize, request: MoveRequest, controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| {
                        editor.move_question(index, request.direction);
                        Ok(())
                    })
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    let add_option = warp::path!("editor" / String / "questions" / usize / "options")
        .and(warp::post())
        .and(admin.clone())
        .and(with_controller.clone())
        .and_then(|id: String, index: usize, controller: SurveyController| async move {
            let draft = controller
                .editors()
                .edit(&id, |editor| editor.add_option(index).map(drop))
                .await;
            Ok::<_, Rejection>(json_reply(draft))
        });

    let option_text = warp::path!("editor" / String / "questions" / usize / "options" / usize)
        .and(warp::put())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(
            |id: String,
             index: usize,
             option: usize,
             request: OptionTextRequest,
             controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| editor.set_option_text(index, option, request.text))
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    let remove_option = warp::path!("editor" / String / "questions" / usize / "options" / usize)
        .and(warp::delete())
        .and(admin.clone())
        .and(with_controller.clone())
        .and_then(
            |id: String, index: usize, option: usize, controller: SurveyController| async move {
                let draft = controller
                    .editors()
                    .edit(&id, |editor| editor.remove_option(index, option).map(drop))
                    .await;
                Ok::<_, Rejection>(json_reply(draft))
            },
        );

    let save = warp::path!("editor" / String / "save")
        .and(warp::post())
        .and(admin.clone())
        .and(with_controller.clone())
        .and_then(|id: String, controller: SurveyController| async move {
            let saved = controller.editors().save(controller.store(), &id).await;
            Ok::<_, Rejection>(json_reply(saved))
        });

    let discard = warp::path!("editor" / String)
        .and(warp::delete())
        .and(admin)
        .and(with_controller)
        .and_then(|id: String, controller: SurveyController| async move {
            let discarded = controller
                .editors()
                .discard(&id)
                .await
                .map(|()| Deleted { deleted: id });
            Ok::<_, Rejection>(json_reply(discarded))
        });

    open.or(draft)
        .or(details)
        .or(add_question)
        .or(update_question)
        .or(delete_question)
        .or(move_question)
        .or(add_option)
        .or(option_text)
        .or(remove_option)
        .or(save)
        .or(discard)
}

fn kiosk(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_controller = filters::with_controller(controller);

    let published = warp::path!("kiosk" / "surveys")
        .and(warp::get())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            let surveys = controller
                .store()
                .published_surveys()
                .into_iter()
                .map(|survey| SurveyChoice {
                    id: survey.id,
                    title: survey.title,
                })
                .collect::<Vec<_>>();

            reply::json(&surveys).into_response()
        });

    let view = warp::path!("kiosk")
        .and(warp::get())
        .and(with_controller.clone())
        .and_then(|controller: SurveyController| async move {
            let view = controller.kiosk().view().await;
            Ok::<_, Rejection>(reply::json(&view).into_response())
        });

    let select = warp::path!("kiosk" / "select" / String)
        .and(warp::post())
        .and(with_controller.clone())
        .and_then(|id: String, controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.kiosk().select(&id).await))
        });

    let start = warp::path!("kiosk" / "start")
        .and(warp::post())
        .and(with_controller.clone())
        .and_then(|controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.kiosk().start().await))
        });

    let restart = warp::path!("kiosk" / "restart")
        .and(warp::post())
        .and(with_controller.clone())
        .and_then(|controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.kiosk().restart().await))
        });

    let submit = warp::path!("kiosk" / "submit")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .and_then(|form: FormData, controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.kiosk().submit(&form).await))
        });

    let admin = warp::path!("kiosk" / "admin")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller)
        .and_then(|request: AdminRequest, controller: SurveyController| async move {
            Ok::<_, Rejection>(json_reply(controller.admin_login(&request).await))
        });

    published
        .or(view)
        .or(select)
        .or(start)
        .or(restart)
        .or(submit)
        .or(admin)
}

fn reports(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let admin = filters::admin(controller.clone());
    let with_controller = filters::with_controller(controller);

    let analytics = warp::path!("analytics" / String)
        .and(warp::get())
        .and(admin.clone())
        .and(warp::query::<DateFilter>())
        .and(with_controller.clone())
        .map(|id: String, filter: DateFilter, controller: SurveyController| {
            json_reply(controller.analytics(&id, filter))
        });

    let export = warp::path!("export" / String / String)
        .and(warp::get())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|id: String, kind: String, controller: SurveyController| {
            let store = controller.store();
            let now = Utc::now();

            let download = match kind.as_str() {
                "csv" => export::export_csv(store, &id, controller.offset(), now),
                "json" => export::export_responses_json(store, &id, now),
                "survey" => export::export_survey_definition(store, &id, now),
                "backup" => export::export_survey_backup(store, &id, now),
                _ => Err(Error::NotFound(format!("{}/{}", id, kind))),
            };

            download_reply(download)
        });

    let clear_responses = warp::path!("responses")
        .and(warp::delete())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            json_reply(
                controller
                    .store()
                    .clear_all_responses()
                    .map(|removed| Cleared { removed })
                    .map_err(Error::from),
            )
        });

    let import = warp::path!("import")
        .and(warp::post())
        .and(admin)
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::bytes())
        .and(with_controller)
        .map(|body: warp::hyper::body::Bytes, controller: SurveyController| {
            let raw = String::from_utf8_lossy(&body);
            json_reply(controller.import(&raw))
        });

    analytics.or(export).or(clear_responses).or(import)
}

fn settings(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let admin = filters::admin(controller.clone());
    let with_controller = filters::with_controller(controller);

    let master_password = warp::path!("master-password")
        .and(warp::put())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .map(|request: MasterPasswordRequest, controller: SurveyController| {
            json_reply(builder::setup_master_password(
                controller.store(),
                &request.password,
                &request.confirmation,
            ))
        });

    let kiosk_survey = warp::path!("kiosk-survey")
        .and(warp::get())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            reply::json(&builder::kiosk_survey_status(controller.store())).into_response()
        });

    let set_kiosk_survey = warp::path!("kiosk-survey")
        .and(warp::put())
        .and(admin.clone())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .map(|request: KioskSurveyRequest, controller: SurveyController| {
            let store = controller.store();
            json_reply(
                builder::set_kiosk_survey(store, &request.id)
                    .map(|()| builder::kiosk_survey_status(store)),
            )
        });

    let clear_kiosk_survey = warp::path!("kiosk-survey")
        .and(warp::delete())
        .and(admin.clone())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            let store = controller.store();
            json_reply(
                builder::clear_kiosk_survey(store).map(|()| builder::kiosk_survey_status(store)),
            )
        });

    let preferences = warp::path!("preferences")
        .and(warp::get())
        .and(with_controller.clone())
        .map(|controller: SurveyController| {
            reply::json(&Preferences::load(controller.store())).into_response()
        });

    let set_preferences = warp::path!("preferences")
        .and(warp::put())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_controller.clone())
        .map(|request: PreferencesRequest, controller: SurveyController| {
            json_reply(update_preferences(controller.store(), &request))
        });

    let storage = warp::path!("storage")
        .and(warp::get())
        .and(admin)
        .and(with_controller)
        .map(|controller: SurveyController| {
            reply::json(&controller.store().storage_info()).into_response()
        });

    master_password
        .or(kiosk_survey)
        .or(set_kiosk_survey)
        .or(clear_kiosk_survey)
        .or(preferences)
        .or(set_preferences)
        .or(storage)
}

async fn handle_rejection(err: Rejection) -> Result<reply::Response, Infallible> {
    let reply = if err.find::<Unauthorized>().is_some() {
        error_reply(&Error::Unauthorized)
    } else if err.is_not_found() {
        let reply = ErrorReply {
            error: "NotFound",
            message: "Not found".into(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::NOT_FOUND).into_response()
    } else if let Some(body) = err.find::<warp::body::BodyDeserializeError>() {
        let reply = ErrorReply {
            error: "BadRequest",
            message: body.to_string(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::BAD_REQUEST).into_response()
    } else if err.find::<reject::InvalidQuery>().is_some() {
        let reply = ErrorReply {
            error: "BadRequest",
            message: "Dates must be YYYY-MM-DD".into(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::BAD_REQUEST).into_response()
    } else if err.find::<reject::PayloadTooLarge>().is_some() {
        let reply = ErrorReply {
            error: "PayloadTooLarge",
            message: "Request body is too large".into(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::PAYLOAD_TOO_LARGE)
            .into_response()
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        let reply = ErrorReply {
            error: "MethodNotAllowed",
            message: "Method not allowed".into(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::METHOD_NOT_ALLOWED)
            .into_response()
    } else {
        error!("Unhandled rejection: {:?}", err);
        let reply = ErrorReply {
            error: "Internal",
            message: "Internal error".into(),
        };
        reply::with_status(reply::json(&reply), http::StatusCode::INTERNAL_SERVER_ERROR)
            .into_response()
    };

    Ok(reply)
}

pub fn routes(
    controller: SurveyController,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    surveys(controller.clone())
        .or(editor(controller.clone()))
        .or(kiosk(controller.clone()))
        .or(reports(controller.clone()))
        .or(settings(controller))
        .recover(handle_rejection)
}
