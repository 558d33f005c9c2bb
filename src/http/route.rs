//! URL-to-resource resolution.
//!
//! A small fixed table maps registered paths to pages; the two POST routes
//! consult the credential store and pick their page from the result.
//! Everything else resolves literally under the document root.

use crate::http::Method;
use crate::store::UserDb;

/// Resource a bare `/` request is rewritten to.
pub const LANDING_PAGE: &str = "/index.html";

const LOGIN_PAGE: &str = "/login.html";
const REGISTER_PAGE: &str = "/register.html";
const WELCOME_PAGE: &str = "/welcome.html";
const LOGIN_ERROR_PAGE: &str = "/login_error.html";
const REGISTER_ERROR_PAGE: &str = "/register_error.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// POST body is not a well-formed `user=...&password=...` form.
    MalformedForm,
}

/// Resolve a parsed request to a root-relative page path.
pub fn resolve(
    method: Method,
    url: &str,
    body: Option<&str>,
    db: &UserDb,
) -> Result<String, RouteError> {
    let page = match (method, url) {
        (Method::Post, "/login") => {
            let (name, password) = parse_form(body.unwrap_or(""))?;
            if db.lookup(&name).as_deref() == Some(password.as_str()) {
                WELCOME_PAGE
            } else {
                LOGIN_ERROR_PAGE
            }
        }
        (Method::Post, "/register") => {
            let (name, password) = parse_form(body.unwrap_or(""))?;
            if db.insert_if_absent(&name, &password) {
                LOGIN_PAGE
            } else {
                REGISTER_ERROR_PAGE
            }
        }
        (Method::Get, "/login") => LOGIN_PAGE,
        (Method::Get, "/register") => REGISTER_PAGE,
        _ => return Ok(url.to_string()),
    };
    Ok(page.to_string())
}

/// Extract `user` and `password` fields from a form body.
fn parse_form(body: &str) -> Result<(String, String), RouteError> {
    let mut name = None;
    let mut password = None;
    for pair in body.split('&') {
        let (key, value) = pair.split_once('=').ok_or(RouteError::MalformedForm)?;
        match key {
            "user" => name = Some(value.to_string()),
            "password" => password = Some(value.to_string()),
            _ => {}
        }
    }
    match (name, password) {
        (Some(name), Some(password)) => Ok((name, password)),
        _ => Err(RouteError::MalformedForm),
    }
}
