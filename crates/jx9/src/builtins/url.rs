//! `parse_url`: split a URL into its components.

use crate::{
    object::Object,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("parse_url", parse_url);
}

/// Returns an object with the present components of the URL: `scheme`,
/// `user`, `pass`, `host`, `port`, `path`, `query`, `fragment`. Returns
/// false on inputs with no recognizable structure.
fn parse_url(ctx: &mut CallContext<'_>) -> FnResult {
    let url = ctx.arg_str(0);
    match split_url(&url) {
        Some(parts) => ctx.result_object(&Object::Map(parts)),
        None => ctx.result_bool(false),
    }
    FnResult::Ok
}

fn split_url(url: &str) -> Option<Vec<(String, Object)>> {
    if url.is_empty() {
        return None;
    }
    let mut parts: Vec<(String, Object)> = Vec::new();
    let mut rest = url;
    if let Some((scheme, tail)) = rest.split_once("://") {
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
            return None;
        }
        parts.push(("scheme".to_string(), Object::from(scheme)));
        rest = tail;
    }
    // The fragment and query hang off the end, regardless of authority.
    let (rest, fragment) = match rest.split_once('#') {
        Some((r, f)) => (r, Some(f)),
        None => (rest, None),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((r, q)) => (r, Some(q)),
        None => (rest, None),
    };
    let (authority, path) = if parts.is_empty() {
        // No scheme: the whole thing is a path.
        ("", rest)
    } else {
        match rest.find('/') {
            Some(at) => rest.split_at(at),
            None => (rest, ""),
        }
    };
    if !authority.is_empty() {
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };
        if let Some(userinfo) = userinfo {
            match userinfo.split_once(':') {
                Some((user, pass)) => {
                    parts.push(("user".to_string(), Object::from(user)));
                    parts.push(("pass".to_string(), Object::from(pass)));
                }
                None => parts.push(("user".to_string(), Object::from(userinfo))),
            }
        }
        match hostport.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                parts.push(("host".to_string(), Object::from(host)));
                parts.push(("port".to_string(), Object::Int(port.parse().unwrap_or(0))));
            }
            _ => parts.push(("host".to_string(), Object::from(hostport))),
        }
    }
    if !path.is_empty() {
        parts.push(("path".to_string(), Object::from(path)));
    }
    if let Some(query) = query {
        parts.push(("query".to_string(), Object::from(query)));
    }
    if let Some(fragment) = fragment {
        parts.push(("fragment".to_string(), Object::from(fragment)));
    }
    if parts.is_empty() { None } else { Some(parts) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(parts: &'a [(String, Object)], key: &str) -> Option<&'a Object> {
        parts.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn full_url_splits() {
        let parts = split_url("http://ada:pw@example.com:8080/docs/x?q=1#top").unwrap();
        assert_eq!(get(&parts, "scheme"), Some(&Object::from("http")));
        assert_eq!(get(&parts, "user"), Some(&Object::from("ada")));
        assert_eq!(get(&parts, "pass"), Some(&Object::from("pw")));
        assert_eq!(get(&parts, "host"), Some(&Object::from("example.com")));
        assert_eq!(get(&parts, "port"), Some(&Object::Int(8080)));
        assert_eq!(get(&parts, "path"), Some(&Object::from("/docs/x")));
        assert_eq!(get(&parts, "query"), Some(&Object::from("q=1")));
        assert_eq!(get(&parts, "fragment"), Some(&Object::from("top")));
    }

    #[test]
    fn bare_path() {
        let parts = split_url("/just/a/path").unwrap();
        assert_eq!(get(&parts, "path"), Some(&Object::from("/just/a/path")));
        assert!(get(&parts, "host").is_none());
    }
}
