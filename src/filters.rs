use tracing::debug;
use warp::{
    reject::{self, Reject},
    Filter,
};

use crate::controllers::SurveyController;

#[derive(Debug)]
pub struct Unauthorized;

impl Reject for Unauthorized {}

pub fn with_controller(
    controller: SurveyController,
) -> impl Filter<Extract = (SurveyController,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || controller.clone())
}

/// Passes when no master password is set, otherwise requires
/// `Authorization: Admin <token>` with a valid token.
pub fn admin(
    controller: SurveyController,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional("Authorization")
        .and(with_controller(controller))
        .and_then(
            move |auth: Option<String>, controller: SurveyController| async move {
                if !controller.requires_admin() {
                    return Ok(());
                }

                let auth = auth.ok_or_else(|| reject::custom(Unauthorized))?;

                let mut parts = auth.splitn(2, ' ');
                let kind = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;
                let value = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;

                if !kind.eq_ignore_ascii_case("admin") {
                    return Err(reject::custom(Unauthorized));
                }

                controller
                    .decode_admin(value)
                    .map(|_session| ())
                    .map_err(|err| {
                        debug!("Rejected admin token: {}", err);
                        reject::custom(Unauthorized)
                    })
            },
        )
        .untuple_one()
}
