use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::{redirect, Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{cookie_pairs, QrCode, QrPoll, QzoneApi, Session, UpstreamError};

const APP_ID: &str = "549000912";
const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
/// Upstream code for "not logged in".
const CODE_NOT_LOGGED_IN: i64 = -3000;

/// Base URLs of the upstream web endpoints; overridable for tests.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ptlogin: String,
    pub upload: String,
    pub user: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ptlogin: "https://ssl.ptlogin2.qq.com".into(),
            upload: "https://up.qzone.qq.com".into(),
            user: "https://user.qzone.qq.com".into(),
        }
    }
}

/// Talks to the public web endpoints with the session cookie it is handed.
#[derive(Clone)]
pub struct HttpQzone {
    http: Client,
    endpoints: Endpoints,
}

#[derive(Deserialize)]
struct UploadData {
    albumid: String,
    lloc: String,
    sloc: String,
    #[serde(rename = "type")]
    kind: i64,
    height: i64,
    width: i64,
    url: String,
}

impl HttpQzone {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        Self::with_endpoints(timeout, Endpoints::default())
    }

    pub fn with_endpoints(timeout: Duration, endpoints: Endpoints) -> Result<Self, UpstreamError> {
        // Login redirects carry the cookies we need, so they are read by hand.
        let http = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self { http, endpoints })
    }

    async fn upload_image(&self, session: &Session, bytes: &[u8]) -> Result<UploadData, UpstreamError> {
        let g_tk = session.g_tk().to_string();
        let uin = session.uin().to_string();
        let url = format!("{}/cgi-bin/upload/cgi_upload_image?g_tk={g_tk}", self.endpoints.upload);
        let picfile = base64::engine::general_purpose::STANDARD.encode(bytes);
        let form: [(&str, &str); 20] = [
            ("filename", "filename"),
            ("uploadtype", "1"),
            ("albumtype", "7"),
            ("exttype", "0"),
            ("skey", session.skey()),
            ("zzpaneluin", uin.as_str()),
            ("p_uin", uin.as_str()),
            ("uin", uin.as_str()),
            ("p_skey", session.p_skey()),
            ("output_type", "json"),
            ("refer", "shuoshuo"),
            ("charset", "utf-8"),
            ("output_charset", "utf-8"),
            ("upload_hd", "1"),
            ("hd_width", "2048"),
            ("hd_height", "10000"),
            ("hd_quality", "96"),
            ("url", url.as_str()),
            ("base64", "1"),
            ("picfile", picfile.as_str()),
        ];
        let body = self
            .http
            .post(&url)
            .header(COOKIE, session.raw())
            .header(USER_AGENT, BROWSER_UA)
            .form(&form)
            .send()
            .await?
            .text()
            .await?;
        let v = callback_json(&body)?;
        check_code(&v, "ret")?;
        serde_json::from_value(v["data"].clone())
            .map_err(|e| UpstreamError::Protocol(format!("upload response: {e}")))
    }
}

/// Extracts the JSON object from `_Callback({...})`-style bodies.
fn callback_json(body: &str) -> Result<Value, UpstreamError> {
    let start = body.find('{');
    let end = body.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&body[s..=e])
            .map_err(|e| UpstreamError::Protocol(format!("bad json: {e}"))),
        _ => Err(UpstreamError::Protocol(format!("no json object in `{}`", truncate(body)))),
    }
}

fn check_code(v: &Value, field: &str) -> Result<(), UpstreamError> {
    let code = v[field].as_i64().unwrap_or(0);
    match code {
        0 => Ok(()),
        CODE_NOT_LOGGED_IN => Err(UpstreamError::SessionExpired),
        code => Err(UpstreamError::Rejected {
            code,
            message: v["message"].as_str().or(v["msg"].as_str()).unwrap_or_default().to_string(),
        }),
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(80) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// `ptqrtoken` derived from the `qrsig` cookie.
fn qr_token(qrsig: &str) -> i64 {
    let mut e: i64 = 0;
    for c in qrsig.chars() {
        e = e.wrapping_add((e << 5).wrapping_add(c as i64));
    }
    e & 0x7fff_ffff
}

/// `name=value` pairs from every Set-Cookie header of a response.
fn set_cookies(resp: &Response) -> Vec<(String, String)> {
    resp.headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .filter_map(|h| h.split(';').next())
        .filter_map(|kv| cookie_pairs(kv).next())
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parses `ptuiCB('66','0','','0','msg', '')` into its quoted arguments.
fn ptui_args(body: &str) -> Vec<String> {
    let inner = body
        .find('(')
        .and_then(|s| body.rfind(')').map(|e| &body[s + 1..e]))
        .unwrap_or_default();
    inner
        .split(',')
        .map(|a| a.trim().trim_matches('\'').to_string())
        .collect()
}

/// `bo` query parameter of an uploaded image URL.
fn pic_bo(url: &str) -> String {
    url.split_once('?')
        .map(|(_, q)| q)
        .unwrap_or_default()
        .split('&')
        .find_map(|kv| kv.strip_prefix("bo="))
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl QzoneApi for HttpQzone {
    async fn publish(&self, session: &Session, text: &str, images: &[Vec<u8>]) -> Result<String, UpstreamError> {
        let mut richvals = Vec::with_capacity(images.len());
        let mut bos = Vec::with_capacity(images.len());
        for (i, bytes) in images.iter().enumerate() {
            let up = self.upload_image(session, bytes).await?;
            debug!(index = i, albumid = %up.albumid, "uploaded image");
            richvals.push(format!(
                ",{},{},{},{},{},{},,{},{}",
                up.albumid, up.lloc, up.sloc, up.kind, up.height, up.width, up.height, up.width
            ));
            bos.push(pic_bo(&up.url));
        }

        let uin = session.uin().to_string();
        let url = format!(
            "{}/proxy/domain/taotao.qzone.qq.com/cgi-bin/emotion_cgi_publish_v6?g_tk={}",
            self.endpoints.user,
            session.g_tk()
        );
        let referrer = format!("https://user.qzone.qq.com/{uin}");
        let richval = richvals.join("\t");
        let pic_bo = bos.join(",");
        let mut form: Vec<(&str, &str)> = vec![
            ("syn_tweet_verson", "1"),
            ("paramstr", "1"),
            ("who", "1"),
            ("con", text),
            ("feedversion", "1"),
            ("ver", "1"),
            ("ugc_right", "1"),
            ("to_sign", "0"),
            ("hostuin", uin.as_str()),
            ("code_version", "1"),
            ("format", "json"),
            ("qzreferrer", referrer.as_str()),
        ];
        if !images.is_empty() {
            form.extend([
                ("richtype", "1"),
                ("subrichtype", "1"),
                ("richval", richval.as_str()),
                ("pic_bo", pic_bo.as_str()),
            ]);
        }
        let body = self
            .http
            .post(&url)
            .header(COOKIE, session.raw())
            .header(USER_AGENT, BROWSER_UA)
            .form(&form)
            .send()
            .await?
            .text()
            .await?;
        let v = callback_json(&body)?;
        check_code(&v, "code")?;
        match v["tid"].as_str() {
            Some(tid) if !tid.is_empty() => Ok(tid.to_string()),
            _ => Err(UpstreamError::Protocol("publish response carries no tid".into())),
        }
    }

    async fn ping(&self, session: &Session) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/proxy/domain/taotao.qq.com/cgi-bin/emotion_cgi_msglist_v6?uin={}&pos=0&num=1&format=json&g_tk={}",
            self.endpoints.user,
            session.uin(),
            session.g_tk()
        );
        let resp = self
            .http
            .get(&url)
            .header(COOKIE, session.raw())
            .header(USER_AGENT, BROWSER_UA)
            .send()
            .await?;
        if resp.status().is_redirection() {
            return Err(UpstreamError::SessionExpired);
        }
        let v = callback_json(&resp.text().await?)?;
        check_code(&v, "code")
    }

    async fn get_qr_code(&self) -> Result<QrCode, UpstreamError> {
        let t: f64 = rand::thread_rng().gen();
        let url = format!(
            "{}/ptqrshow?appid={APP_ID}&e=2&l=M&s=3&d=72&v=4&t={t}&daid=5&pt_3rd_aid=0",
            self.endpoints.ptlogin
        );
        let resp = self.http.get(&url).header(USER_AGENT, BROWSER_UA).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Transport(format!("qr code request returned {}", resp.status())));
        }
        let handle = set_cookies(&resp)
            .into_iter()
            .find(|(k, _)| k == "qrsig")
            .map(|(_, v)| v)
            .ok_or_else(|| UpstreamError::Protocol("qr response carries no qrsig".into()))?;
        let image = resp.bytes().await?.to_vec();
        Ok(QrCode { image, handle })
    }

    async fn poll_qr_login(&self, qr: &QrCode) -> Result<QrPoll, UpstreamError> {
        let u1 = urlencoding::encode("https://qzs.qq.com/qzone/v5/loginsucc.html?para=izone");
        let url = format!(
            "{}/ptqrlogin?u1={u1}&ptqrtoken={}&ptredirect=0&h=1&t=1&g=1&from_ui=1&ptlang=2052&action=0-0-{}\
             &js_ver=21010623&js_type=1&login_sig=&pt_uistyle=40&aid={APP_ID}&daid=5",
            self.endpoints.ptlogin,
            qr_token(&qr.handle),
            chrono::Utc::now().timestamp_millis()
        );
        let resp = self
            .http
            .get(&url)
            .header(COOKIE, format!("qrsig={}", qr.handle))
            .header(USER_AGENT, BROWSER_UA)
            .send()
            .await?;
        let mut jar = set_cookies(&resp);
        let args = ptui_args(&resp.text().await?);
        match args.first().map(String::as_str) {
            Some("66") => Ok(QrPoll::Waiting),
            Some("67") => Ok(QrPoll::Scanned),
            Some("65") => Ok(QrPoll::Expired),
            Some("0") => {
                let redirect = args.get(2).cloned().unwrap_or_default();
                if redirect.is_empty() {
                    return Err(UpstreamError::Protocol("login succeeded without redirect".into()));
                }
                // check_sig hands out p_skey for the target domain
                let resp = self.http.get(&redirect).header(USER_AGENT, BROWSER_UA).send().await?;
                jar.extend(set_cookies(&resp));
                let cookie = jar.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("; ");
                Ok(QrPoll::Success { cookie })
            }
            other => {
                warn!(code = ?other, "unexpected qr poll response");
                Err(UpstreamError::Protocol(format!("qr poll code {other:?}")))
            }
        }
    }
}
