//! Tracking and notification-center URL builders.
//!
//! Unsubscribe/confirm links are reproducible from (email, list id, list
//! name, workspace id, message id): the HMAC is derived from the contact
//! email under the workspace secret key, so the feedback service can verify
//! a request without any stored state.

use url::form_urlencoded::Serializer;

use mailtide_utils::crypto::email_hmac;

fn base(endpoint: &str, path: &str) -> String {
    format!("{}{}", endpoint.trim_end_matches('/'), path)
}

/// `<endpoint>/visit?mid=&wid=&ts=&url=` — click redirect.
pub fn visit_url(
    endpoint: &str,
    message_id: &str,
    workspace_id: &str,
    timestamp: i64,
    original_url: &str,
) -> String {
    let query = Serializer::new(String::new())
        .append_pair("mid", message_id)
        .append_pair("wid", workspace_id)
        .append_pair("ts", &timestamp.to_string())
        .append_pair("url", original_url)
        .finish();
    format!("{}?{}", base(endpoint, "/visit"), query)
}

/// `<endpoint>/opens?mid=&wid=&ts=` — tracking pixel.
pub fn opens_url(endpoint: &str, message_id: &str, workspace_id: &str, timestamp: i64) -> String {
    let query = Serializer::new(String::new())
        .append_pair("mid", message_id)
        .append_pair("wid", workspace_id)
        .append_pair("ts", &timestamp.to_string())
        .finish();
    format!("{}?{}", base(endpoint, "/opens"), query)
}

#[allow(clippy::too_many_arguments)]
fn notification_center_action(
    endpoint: &str,
    action: &str,
    email: &str,
    secret_key: &str,
    list_id: &str,
    list_name: &str,
    message_id: &str,
    workspace_id: &str,
) -> String {
    let query = Serializer::new(String::new())
        .append_pair("action", action)
        .append_pair("email", email)
        .append_pair("email_hmac", &email_hmac(email, secret_key))
        .append_pair("lid", list_id)
        .append_pair("lname", list_name)
        .append_pair("mid", message_id)
        .append_pair("wid", workspace_id)
        .finish();
    format!("{}?{}", base(endpoint, "/notification-center"), query)
}

pub fn unsubscribe_url(
    endpoint: &str,
    email: &str,
    secret_key: &str,
    list_id: &str,
    list_name: &str,
    message_id: &str,
    workspace_id: &str,
) -> String {
    notification_center_action(
        endpoint,
        "unsubscribe",
        email,
        secret_key,
        list_id,
        list_name,
        message_id,
        workspace_id,
    )
}

pub fn confirm_subscription_url(
    endpoint: &str,
    email: &str,
    secret_key: &str,
    list_id: &str,
    list_name: &str,
    message_id: &str,
    workspace_id: &str,
) -> String {
    notification_center_action(
        endpoint,
        "confirm",
        email,
        secret_key,
        list_id,
        list_name,
        message_id,
        workspace_id,
    )
}

/// Subscriber-facing preference page, no action.
pub fn notification_center_url(
    endpoint: &str,
    email: &str,
    secret_key: &str,
    workspace_id: &str,
) -> String {
    let query = Serializer::new(String::new())
        .append_pair("email", email)
        .append_pair("email_hmac", &email_hmac(email, secret_key))
        .append_pair("wid", workspace_id)
        .finish();
    format!("{}?{}", base(endpoint, "/notification-center"), query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtide_utils::crypto::verify_email_hmac;

    #[test]
    fn test_visit_url_escapes_original() {
        let url = visit_url(
            "https://t.acme.test/",
            "m-1",
            "acme",
            1700000000,
            "https://shop.test/?a=1&b=2",
        );
        assert!(url.starts_with("https://t.acme.test/visit?mid=m-1&wid=acme&ts=1700000000&url="));
        assert!(url.contains("url=https%3A%2F%2Fshop.test%2F%3Fa%3D1%26b%3D2"));
    }

    #[test]
    fn test_opens_url_shape() {
        let url = opens_url("https://t.acme.test", "m-1", "acme", 42);
        assert_eq!(url, "https://t.acme.test/opens?mid=m-1&wid=acme&ts=42");
    }

    #[test]
    fn test_unsubscribe_url_carries_verifiable_hmac() {
        let url = unsubscribe_url(
            "https://t.acme.test",
            "x@y.test",
            "ws-secret",
            "list-1",
            "Newsletter",
            "m-1",
            "acme",
        );
        assert!(url.contains("action=unsubscribe"));
        assert!(url.contains("lid=list-1"));
        assert!(url.contains("lname=Newsletter"));

        let parsed = url::Url::parse(&url).unwrap();
        let hmac = parsed
            .query_pairs()
            .find(|(k, _)| k == "email_hmac")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert!(verify_email_hmac("x@y.test", "ws-secret", &hmac));
        assert!(!verify_email_hmac("other@y.test", "ws-secret", &hmac));
    }

    #[test]
    fn test_reproducibility() {
        let build = || {
            unsubscribe_url(
                "https://t.acme.test",
                "x@y.test",
                "ws-secret",
                "list-1",
                "News",
                "m-1",
                "acme",
            )
        };
        assert_eq!(build(), build());
    }
}
