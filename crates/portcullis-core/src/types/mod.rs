//! Identity types shared by the gateway and the CLI.

use serde::{Deserialize, Deserializer, Serialize};

/// Role value that matches every role.
pub const ANY_ROLE: &str = "*";

/// A user profile, as delivered by the identity provider or the local
/// credential store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable identifier. Providers may send it as a number or a string.
    #[serde(default, deserialize_with = "id_from_number_or_string")]
    pub id: i64,

    /// Login name.
    #[serde(default)]
    pub login: String,

    /// Display name.
    #[serde(default, rename = "displayName")]
    pub display_name: String,

    /// Email address.
    #[serde(default)]
    pub email: String,

    /// Given name.
    #[serde(default)]
    pub name: String,

    /// Family name.
    #[serde(default)]
    pub surname: String,

    /// Role memberships.
    #[serde(default, rename = "memberOf")]
    pub roles: Vec<String>,

    /// Administrator flag. Recomputed from `roles` on every request.
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
}

impl User {
    /// Whether the user holds `role` exactly.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        !role.is_empty() && self.roles.iter().any(|r| r == role)
    }
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    // Non-numeric identifiers carry no meaning for the gateway.
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(id)) => id,
        Some(RawId::Text(text)) => text.trim().parse().unwrap_or_default(),
        None => 0,
    })
}

/// The identity carried inside a session or share token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPrincipal {
    /// Profile of the authenticated user.
    #[serde(flatten)]
    pub user: User,

    /// URL the token is restricted to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Whether only safe methods are permitted.
    #[serde(default)]
    pub readonly: bool,

    /// Label of the party a share token was issued for.
    #[serde(default, rename = "sharinguserlogin")]
    pub sharing_user_login: String,

    /// Anti-forgery value the client echoes back in a header.
    #[serde(default, rename = "xsrftoken")]
    pub xsrf_token: String,
}

impl From<User> for SessionPrincipal {
    fn from(user: User) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }
}

/// Whether any of `user_roles` satisfies `allowed`.
///
/// `*` in `allowed` admits everyone. Otherwise this is an exact,
/// case-sensitive intersection; empty strings never match.
#[must_use]
pub fn roles_allowed(user_roles: &[String], allowed: &[String]) -> bool {
    if allowed.iter().any(|r| r == ANY_ROLE) {
        return true;
    }
    user_roles
        .iter()
        .filter(|r| !r.is_empty())
        .any(|r| allowed.iter().any(|a| a == r))
}

/// Normalize a directory-style role: keep the first comma-separated
/// component and drop a leading `CN=`.
///
/// `CN=ADMINS,OU=groups,DC=example` becomes `ADMINS`.
#[must_use]
pub fn normalize_role(role: &str) -> String {
    let head = role.split(',').next().unwrap_or_default();
    head.strip_prefix("CN=").unwrap_or(head).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roles(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_wildcard_admits_everyone() {
        assert!(roles_allowed(&[], &roles(&["*"])));
        assert!(roles_allowed(&roles(&["USERS"]), &roles(&["ADMINS", "*"])));
    }

    #[test]
    fn test_role_intersection() {
        assert!(roles_allowed(&roles(&["A", "B"]), &roles(&["B", "C"])));
        assert!(!roles_allowed(&roles(&["A"]), &roles(&["B"])));
        assert!(!roles_allowed(&roles(&["a"]), &roles(&["A"])));
    }

    #[test]
    fn test_empty_sets_never_match() {
        assert!(!roles_allowed(&[], &roles(&["A"])));
        assert!(!roles_allowed(&roles(&["A"]), &[]));
        assert!(!roles_allowed(&roles(&[""]), &roles(&[""])));
    }

    #[test]
    fn test_normalize_role() {
        assert_eq!(normalize_role("CN=ADMINS,OU=groups,DC=example"), "ADMINS");
        assert_eq!(normalize_role("USERS"), "USERS");
        assert_eq!(normalize_role("CN=X"), "X");
        assert_eq!(normalize_role("OU=x,CN=Y"), "OU=x");
        assert_eq!(normalize_role(""), "");
    }

    #[test]
    fn test_principal_wire_names() {
        let principal = SessionPrincipal {
            user: User {
                id: 7,
                login: "alice".to_string(),
                display_name: "Alice".to_string(),
                roles: roles(&["USERS"]),
                ..User::default()
            },
            url: Some("/doc.txt".to_string()),
            readonly: true,
            sharing_user_login: "bob".to_string(),
            xsrf_token: "x".to_string(),
        };

        let value = serde_json::to_value(&principal).unwrap();
        assert_eq!(value["displayName"], "Alice");
        assert_eq!(value["memberOf"][0], "USERS");
        assert_eq!(value["isAdmin"], false);
        assert_eq!(value["sharinguserlogin"], "bob");
        assert_eq!(value["xsrftoken"], "x");
        assert_eq!(value["url"], "/doc.txt");

        let back: SessionPrincipal = serde_json::from_value(value).unwrap();
        assert_eq!(back, principal);
    }

    #[test]
    fn test_user_id_from_string_or_number() {
        let user: User = serde_json::from_str(
            r#"{"displayName":"Us ER","memberOf":["CN=USERS","CN=OTHERS"],"id":"1000","login":"USER"}"#,
        )
        .unwrap();
        assert_eq!(user.id, 1000);
        assert_eq!(user.login, "USER");
        assert_eq!(user.roles, roles(&["CN=USERS", "CN=OTHERS"]));

        let user: User = serde_json::from_str(r#"{"id":42,"login":"a"}"#).unwrap();
        assert_eq!(user.id, 42);

        let user: User = serde_json::from_str(r#"{"id":"a1b2","login":"a"}"#).unwrap();
        assert_eq!(user.id, 0);

        let user: User = serde_json::from_str(r#"{"id":null,"login":"a"}"#).unwrap();
        assert_eq!(user.id, 0);

        let principal: SessionPrincipal =
            serde_json::from_str(r#"{"id":"7","login":"a","readonly":true}"#).unwrap();
        assert_eq!(principal.user.id, 7);
        assert!(principal.readonly);
    }

    #[test]
    fn test_user_has_role() {
        let user = User {
            roles: roles(&["USERS", ""]),
            ..User::default()
        };
        assert!(user.has_role("USERS"));
        assert!(!user.has_role(""));
        assert!(!user.has_role("ADMINS"));
    }
}
