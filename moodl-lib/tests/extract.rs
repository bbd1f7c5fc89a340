use moodl_lib::{
    auth::{self, Step},
    AuthError,
};
use url::Url;

const LOGIN: &str = include_str!("fixtures/login.html");
const CONSENT: &str = include_str!("fixtures/consent.html");

#[test]
fn login_form() {
    let form = auth::extract_login_form(LOGIN).unwrap();

    assert_eq!(form.action, "/idp/profile/SAML2/Redirect/SSO?execution=e1s1");
    assert_eq!(form.csrf_token, "_4b3a&9f");
}

#[test]
fn login_form_without_csrf_token() {
    let html = LOGIN.replace("csrf_token", "something_else");

    assert!(matches!(
        auth::extract_login_form(&html),
        Err(AuthError::Structure {
            step: Step::LoginForm,
            missing: "CSRF token input"
        })
    ));
}

#[test]
fn login_form_outside_content_container() {
    let html = LOGIN.replace(r#"id="content""#, r#"id="main""#);

    assert!(matches!(
        auth::extract_login_form(&html),
        Err(AuthError::Structure {
            step: Step::LoginForm,
            missing: "content container"
        })
    ));
}

#[test]
fn consent_form() {
    let form = auth::extract_consent_form(CONSENT).unwrap();

    assert_eq!(
        form.action.as_str(),
        "https://www.moodle.tum.de/Shibboleth.sso/SAML2/POST"
    );
    assert_eq!(
        form.fields,
        [
            ("RelayState".to_owned(), "ss:mem:7f3c".to_owned()),
            (
                "SAMLResponse".to_owned(),
                "PHNhbWxwOlJlc3BvbnNlPg==".to_owned()
            ),
        ]
    );
}

#[test]
fn consent_form_without_form() {
    assert!(matches!(
        auth::extract_consent_form("<html><body><p>Session expired</p></body></html>"),
        Err(AuthError::Structure {
            step: Step::ConsentForm,
            missing: "form"
        })
    ));
}

#[test]
fn login_page_is_not_a_consent_form() {
    // After a wrong password the identity provider shows its login page again.
    let err = auth::extract_consent_form(LOGIN).unwrap_err();

    assert!(matches!(
        err,
        AuthError::InvalidAction {
            step: Step::ConsentForm,
            ..
        }
    ));
    assert_eq!(err.category(), "structure");
}

#[test]
fn assignment_attachments() {
    let page = Url::parse("https://www.moodle.tum.de/mod/assign/view.php?id=7").unwrap();
    let html = r#"<html><body><div role="main">
        <h2>Homework 2</h2>
        <div class="fileuploadsubmission"><a href="https://www.moodle.tum.de/pluginfile.php/9/mod_assign/introattachment/0/sheet%202.pdf?forcedownload=1">sheet 2.pdf</a></div>
        <div class="fileuploadsubmission"><a href="/pluginfile.php/9/mod_assign/introattachment/0/template.zip">template.zip</a></div>
        <a href="/pluginfile.php/9/mod_assign/introattachment/0/template.zip">template.zip</a>
        <a href="/mod/assign/view.php?id=7&amp;action=editsubmission">Add submission</a>
        <a>No link</a>
    </div></body></html>"#;

    let links = moodl_lib::parse_attachment_links(&page, html).unwrap();

    assert_eq!(
        links
            .iter()
            .map(|url| url.path())
            .collect::<Vec<_>>(),
        [
            "/pluginfile.php/9/mod_assign/introattachment/0/sheet%202.pdf",
            "/pluginfile.php/9/mod_assign/introattachment/0/template.zip",
        ]
    );
}
