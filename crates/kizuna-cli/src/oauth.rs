//! Browser login for the services that use an authorization code grant.
//!
//! 1. Open the consent page in the browser.
//! 2. Listen once on localhost:19742 for the redirect carrying `?code=...`.
//! 3. Hand the code (and the PKCE verifier for MyAnimeList) to the
//!    orchestrator as an `AuthenticateUser` request.

use std::io::{BufRead, Read, Write};
use std::net::TcpListener;

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use kizuna_api::{Request, REDIRECT_URI};
use kizuna_core::config::ServicesConfig;
use kizuna_core::models::ServiceKind;

const ANILIST_AUTH_URL: &str = "https://anilist.co/api/v2/oauth/authorize";
const MAL_AUTH_URL: &str = "https://myanimelist.net/v1/oauth2/authorize";
const LISTEN_ADDR: &str = "127.0.0.1:19742";

/// Collect whatever `kind` needs to authenticate and turn it into a request.
pub async fn login_request(
    kind: ServiceKind,
    services: &ServicesConfig,
    username: Option<String>,
) -> Result<Request> {
    match kind {
        ServiceKind::Kitsu => {
            let username = match username {
                Some(name) => name,
                None => prompt("Kitsu username or email: ")?,
            };
            let password = prompt("Password: ")?;
            Ok(Request::password(&username, &password))
        }
        ServiceKind::AniList => {
            let client_id = services
                .anilist
                .client_id
                .as_deref()
                .ok_or_else(|| anyhow!("services.anilist.client_id is not configured"))?;
            let code = browser_flow(authorize_url(ANILIST_AUTH_URL, client_id, None)?).await?;
            Ok(Request::authorization_code(&code, None))
        }
        ServiceKind::MyAnimeList => {
            let client_id = services
                .mal
                .client_id
                .as_deref()
                .ok_or_else(|| anyhow!("services.mal.client_id is not configured"))?;
            let verifier = generate_verifier();
            let url = authorize_url(MAL_AUTH_URL, client_id, Some(&verifier))?;
            let code = browser_flow(url).await?;
            Ok(Request::authorization_code(&code, Some(&verifier)))
        }
    }
}

fn authorize_url(base: &str, client_id: &str, verifier: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", REDIRECT_URI);
        // MyAnimeList only supports the plain method: challenge == verifier.
        if let Some(verifier) = verifier {
            query
                .append_pair("code_challenge", verifier)
                .append_pair("code_challenge_method", "plain");
        }
    }
    Ok(url)
}

async fn browser_flow(url: Url) -> Result<String> {
    // Bind before opening the browser so a fast redirect is not lost.
    let listener = TcpListener::bind(LISTEN_ADDR)
        .with_context(|| format!("failed to bind {LISTEN_ADDR}"))?;

    tracing::info!("Opening authorization page in browser");
    if let Err(e) = open::that(url.as_str()) {
        tracing::warn!("Failed to open browser: {e}");
    }
    eprintln!("If the browser did not open, visit:\n  {url}");

    tokio::task::spawn_blocking(move || listen_for_redirect(listener)).await?
}

/// Accept one connection, answer it and pull the code out of its request line.
fn listen_for_redirect(listener: TcpListener) -> Result<String> {
    tracing::info!("Waiting for OAuth redirect on {LISTEN_ADDR}...");
    let (mut stream, _) = listener.accept().context("failed to accept connection")?;

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).context("failed to read redirect")?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let result = code_from_request(&request);
    let body = match &result {
        Ok(_) => "<h2>Authorization successful!</h2><p>You can close this tab and return to kizuna.</p>",
        Err(_) => "<h2>Authorization failed.</h2><p>Check the terminal for details.</p>",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body>{body}</body></html>"
    );
    let _ = stream.write_all(response.as_bytes());
    result
}

fn code_from_request(request: &str) -> Result<String> {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow!("malformed HTTP request from redirect"))?;
    let url = Url::parse(&format!("http://localhost{path}"))
        .context("failed to parse redirect URL")?;

    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => bail!("authorization denied: {value}"),
            _ => {}
        }
    }
    code.ok_or_else(|| anyhow!("no 'code' parameter in redirect"))
}

/// Random 128-character verifier over the unreserved URL alphabet.
fn generate_verifier() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut out = String::with_capacity(128);
    while out.len() < 128 {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_usize(out.len());
        for byte in hasher.finish().to_le_bytes() {
            if out.len() < 128 {
                out.push(CHARS[byte as usize % CHARS.len()] as char);
            }
        }
    }
    out
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        bail!("no input given");
    }
    Ok(value)
}
