//! Deterministic gRPC names derived from entry paths.
//!
//! Client and server compute the same service and method names from an entry,
//! so no table of names is ever exchanged.

/// Reserved entry of the schema query method every node serves.
pub const META_ENTRY: &str = "_query_proto";

/// Service name of an entry.
///
/// `"Srv/" + entry` with each `/` that precedes a word character dropped and
/// the character upper-cased, then every other non-word character replaced
/// by `_`.
#[must_use]
pub fn service_name(entry: &str) -> String {
    let source = format!("Srv/{entry}");
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            if let Some(&next) = chars.peek().filter(|n| is_word(**n)) {
                out.push(next.to_ascii_uppercase());
                chars.next();
                continue;
            }
        }
        out.push(if is_word(c) { c } else { '_' });
    }
    out
}

/// Method name of an entry: its last segment.
#[must_use]
pub fn method_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Full gRPC request path, `/<service>/<method>`.
#[must_use]
pub fn grpc_path(entry: &str) -> String {
    format!("/{}/{}", service_name(entry), method_name(entry))
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(service_name("testSimple"), "SrvTestSimple");
        assert_eq!(service_name("nested/method"), "SrvNestedMethod");
        assert_eq!(service_name("a-b/c.d"), "SrvA_bC_d");
        assert_eq!(service_name("a//b"), "SrvA_B");
        assert_eq!(service_name(META_ENTRY), "Srv_query_proto");
    }

    #[test]
    fn test_paths() {
        assert_eq!(grpc_path("nested/method"), "/SrvNestedMethod/method");
        assert_eq!(grpc_path(META_ENTRY), "/Srv_query_proto/_query_proto");
        assert_eq!(method_name("plain"), "plain");
    }
}
