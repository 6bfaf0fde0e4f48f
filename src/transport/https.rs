//! HTTPS CGI transport for Zyxel GS1900 switches.
//!
//! The web interface is the only writable surface on this firmware. Login
//! obfuscates the password into a fixed-size filler string, and every form
//! POST must carry the `XSSID` token scraped from the page that rendered
//! the form.

use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::error::{ProtocolError, Result, TransportError};

/// CGI `cmd` values for the pages this client drives.
pub mod cmd {
    pub const VLAN_ADD: u32 = 1284;
    pub const VLAN_ADD_SUBMIT: u32 = 1285;
    pub const VLAN_DELETE_SUBMIT: u32 = 1288;
    pub const PORT_VLAN: u32 = 1290;
    pub const PORT_VLAN_SUBMIT: u32 = 1291;
    pub const VLAN_MEMBERSHIP: u32 = 1293;
    pub const VLAN_MEMBERSHIP_SUBMIT: u32 = 1294;
    pub const PORT_SETTINGS: u32 = 770;
    pub const PORT_SETTINGS_SUBMIT: u32 = 771;
}

/// VLAN membership codes used by the membership form.
pub mod membership {
    pub const EXCLUDED: u8 = 0;
    pub const FORBIDDEN: u8 = 1;
    pub const TAGGED: u8 = 2;
    pub const UNTAGGED: u8 = 3;
}

static XSSID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"name="XSSID"\s+value="([^"]+)""#).unwrap());

const OBFUSCATED_FRAME: usize = 321;
const FILLER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Expand a password into the login form's obfuscated string.
///
/// The device expects a `321 - len` character string with the password
/// characters planted in reverse at positions divisible by 5, the length's
/// tens digit at position 123 and ones digit at position 289, and random
/// alphanumerics everywhere else.
pub fn obfuscate_password(password: &str) -> String {
    let chars: Vec<char> = password.chars().collect();
    let len = chars.len();
    let mut remaining = len;
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(OBFUSCATED_FRAME);

    for i in 1..=(OBFUSCATED_FRAME - len) {
        if i % 5 == 0 && remaining > 0 {
            remaining -= 1;
            out.push(chars[remaining]);
        } else if i == 123 {
            out.push(char::from_digit((len / 10) as u32 % 10, 10).unwrap());
        } else if i == 289 {
            out.push(char::from_digit((len % 10) as u32, 10).unwrap());
        } else {
            out.push(FILLER[rng.gen_range(0..FILLER.len())] as char);
        }
    }
    out
}

/// Authenticated web session against one switch.
pub struct ZyxelWeb {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    session_id: Option<String>,
}

impl ZyxelWeb {
    pub fn new(
        host: &str,
        username: &str,
        password: &str,
        verify_tls: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            http,
            base_url: format!("https://{host}"),
            username: username.to_string(),
            password: password.to_string(),
            session_id: None,
        })
    }

    fn dispatcher(&self) -> String {
        format!("{}/cgi-bin/dispatcher.cgi", self.base_url)
    }

    /// Log in and verify the session id the device hands back.
    pub async fn login(&mut self) -> Result<()> {
        let encoded = obfuscate_password(&self.password);
        let body = format!(
            "username={}&password={}&login=true;",
            self.username, encoded
        );

        let resp = self
            .http
            .post(self.dispatcher())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(TransportError::Http)?;
        let session_id = resp
            .text()
            .await
            .map_err(TransportError::Http)?
            .trim()
            .to_string();

        let check = self
            .http
            .post(self.dispatcher())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("authId={session_id}&login_chk=true"))
            .send()
            .await
            .map_err(TransportError::Http)?
            .text()
            .await
            .map_err(TransportError::Http)?;

        if !check.contains("OK") {
            return Err(ProtocolError::LoginRejected(check.trim().to_string()).into());
        }

        debug!("zyxel web session established");
        self.session_id = Some(session_id);
        Ok(())
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if self.session_id.is_none() {
            self.login().await?;
        }
        Ok(())
    }

    /// Fetch a page by `cmd`, optionally with extra query parameters.
    pub async fn fetch_page(&mut self, cmd: u32, query: &[(&str, String)]) -> Result<String> {
        self.ensure_session().await?;
        let mut url = format!("{}?cmd={cmd}", self.dispatcher());
        for (k, v) in query {
            url.push_str(&format!("&{k}={v}"));
        }
        let page = self
            .http
            .get(url)
            .send()
            .await
            .map_err(TransportError::Http)?
            .text()
            .await
            .map_err(TransportError::Http)?;
        Ok(page)
    }

    /// Scrape the `XSSID` token from a page by `cmd`.
    pub async fn fetch_xssid(&mut self, cmd: u32) -> Result<String> {
        let page = self.fetch_page(cmd, &[]).await?;
        extract_xssid(&page)
    }

    /// Submit a form POST. The caller includes the `XSSID` field.
    pub async fn post_form(&mut self, fields: &[(String, String)]) -> Result<String> {
        self.ensure_session().await?;
        let resp = self
            .http
            .post(self.dispatcher())
            .form(fields)
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = resp.status();
        let body = resp.text().await.map_err(TransportError::Http)?;
        if !status.is_success() {
            return Err(ProtocolError::LoginRejected(format!(
                "form POST returned HTTP {status}"
            ))
            .into());
        }
        Ok(body)
    }

    pub fn forget_session(&mut self) {
        self.session_id = None;
    }
}

/// Pull the per-page XSSID token out of form HTML.
pub fn extract_xssid(page: &str) -> Result<String> {
    XSSID
        .captures(page)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            ProtocolError::MissingToken {
                token: "XSSID".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscated_length_is_frame_minus_password() {
        for pwd in ["abc", "longerpassword12", "x"] {
            let encoded = obfuscate_password(pwd);
            assert_eq!(encoded.chars().count(), OBFUSCATED_FRAME - pwd.len());
        }
    }

    #[test]
    fn password_chars_sit_at_multiples_of_five_reversed() {
        let pwd = "secret";
        let encoded: Vec<char> = obfuscate_password(pwd).chars().collect();
        let mut recovered = String::new();
        // position i in the 1-based loop lands at index i-1
        let mut expected = pwd.chars().rev();
        for i in 1..=(OBFUSCATED_FRAME - pwd.len()) {
            if i % 5 == 0 {
                if let Some(c) = expected.next() {
                    recovered.push(encoded[i - 1]);
                    assert_eq!(encoded[i - 1], c);
                }
            }
        }
        assert_eq!(recovered, pwd.chars().rev().collect::<String>());
    }

    #[test]
    fn length_digits_are_planted() {
        let pwd = "twelvechars1"; // length 12
        let encoded: Vec<char> = obfuscate_password(pwd).chars().collect();
        assert_eq!(encoded[122], '1'); // tens digit at position 123
        assert_eq!(encoded[288], '2'); // ones digit at position 289
    }

    #[test]
    fn xssid_extraction() {
        let page = r#"<form><input type="hidden" name="XSSID" value="a1b2c3d4"></form>"#;
        assert_eq!(extract_xssid(page).unwrap(), "a1b2c3d4");
        assert!(extract_xssid("<html>no token</html>").is_err());
    }
}
