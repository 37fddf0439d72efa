use kube::error::ErrorResponse;

use super::is_not_found;

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("kafkachannels.knativekafka.kyma-project.io \"orders\" {}", reason),
        reason: reason.into(),
        code,
    })
}

#[test]
fn is_not_found_matches_only_404_api_errors() {
    assert!(is_not_found(&api_error(404, "NotFound")), "expected a 404 API error to be not-found");
    assert!(!is_not_found(&api_error(409, "Conflict")), "expected a 409 API error to not be not-found");
    assert!(!is_not_found(&api_error(500, "InternalError")), "expected a 500 API error to not be not-found");
}
