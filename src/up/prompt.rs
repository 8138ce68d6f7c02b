use crate::client::types::{PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity};
use crate::store::CredentialSource;

pub(crate) struct UpPrompt {
    pub title: String,
    pub description: String,
}

fn verification_note(require_user_verification: bool) -> &'static str {
    if require_user_verification {
        "\n\nThe site requires you to verify your identity."
    } else {
        ""
    }
}

pub(crate) fn make_credential_prompt(
    rp: &PublicKeyCredentialRpEntity,
    user: &PublicKeyCredentialUserEntity,
    require_user_verification: bool,
) -> UpPrompt {
    let rp_id = rp.id.as_deref().unwrap_or("(unknown)");
    let site = if rp.name.is_empty() {
        rp_id.to_string()
    } else {
        format!("{} ({rp_id})", rp.name)
    };
    UpPrompt {
        title: "fidolink".to_string(),
        description: format!(
            "Register new passkey\n\nSite: {site}\nAccount: {}{}\n\nPress OK to create, or Cancel to deny.",
            account_label(user),
            verification_note(require_user_verification),
        ),
    }
}

pub(crate) fn get_assertion_prompt(
    source: &CredentialSource,
    position: Option<(usize, usize)>,
    require_user_verification: bool,
) -> UpPrompt {
    let account = if source.other_ui.is_empty() { "(unknown)" } else { source.other_ui.as_str() };
    let counter = match position {
        Some((index, total)) => format!(" ({} of {total})", index + 1),
        None => String::new(),
    };
    UpPrompt {
        title: "fidolink".to_string(),
        description: format!(
            "Sign in with passkey{counter}\n\nSite: {}\nAccount: {account}{}\n\nPress OK to sign in, or Cancel to deny.",
            source.rp_id,
            verification_note(require_user_verification),
        ),
    }
}

/// Label stored with a new credential and shown when signing in.
pub(crate) fn account_label(user: &PublicKeyCredentialUserEntity) -> String {
    match (user.display_name.as_str(), user.name.as_str()) {
        ("", "") => "(unknown)".to_string(),
        ("", name) => name.to_string(),
        (display, "") => display.to_string(),
        (display, name) if display == name => display.to_string(),
        (display, name) => format!("{display} <{name}>"),
    }
}
