use serde::Serialize;
use uuid::Uuid;

/// The authenticated user, passed explicitly into every core operation.
/// Identity itself is resolved upstream; this is only the scoping context.
///
/// Serializes to the automation webhook's identity envelope, which uses
/// Spanish field names (`nombre`, `plan`).
#[derive(Debug, Clone, Serialize)]
pub struct UserRef {
    pub id: Uuid,
    pub email: String,
    #[serde(rename = "nombre")]
    pub display_name: String,
    pub plan: String,
}

impl UserRef {
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        let email = email.into();
        // same default the dashboard used: local part of the email address
        let display_name = email
            .split('@')
            .next()
            .filter(|part| !part.is_empty())
            .unwrap_or("Usuario")
            .to_string();
        Self {
            id,
            email,
            display_name,
            plan: "freemium".to_string(),
        }
    }

    pub fn with_profile(
        mut self,
        display_name: Option<String>,
        plan: Option<String>,
    ) -> Self {
        if let Some(name) = display_name {
            self.display_name = name;
        }
        if let Some(plan) = plan {
            self.plan = plan;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_defaults_to_email_local_part() {
        let user = UserRef::new(Uuid::new_v4(), "ana@example.com");
        assert_eq!(user.display_name, "ana");
        assert_eq!(user.plan, "freemium");
    }

    #[test]
    fn profile_overrides_defaults() {
        let user = UserRef::new(Uuid::new_v4(), "ana@example.com")
            .with_profile(Some("Ana Torres".into()), Some("pro".into()));
        assert_eq!(user.display_name, "Ana Torres");
        assert_eq!(user.plan, "pro");
    }

    #[test]
    fn serializes_webhook_field_names() {
        let user = UserRef::new(Uuid::new_v4(), "ana@example.com");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("nombre").is_some());
        assert!(json.get("display_name").is_none());
    }
}
