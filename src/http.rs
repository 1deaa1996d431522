//! Request and response snapshots exchanged between the host, the worker and the caches.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }

  /// Only plain retrievals go through the cache policies.
  pub fn is_cacheable(self) -> bool {
    self == Self::Get
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// Top-level navigation
  Document,
  Script,
  Style,
  Image,
  /// fetch()/XHR and anything else without a specific destination
  #[default]
  Empty,
}

impl Destination {
  /// Guess the destination from the path extension, the way a page would
  /// tag a sub-resource it loads. Extensionless paths are app routes and
  /// count as navigations.
  pub fn infer(url: &Url) -> Self {
    let segment = url.path().rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = segment.rsplit_once('.') else {
      return Self::Document;
    };
    match ext.to_ascii_lowercase().as_str() {
      "js" | "mjs" => Self::Script,
      "css" => Self::Style,
      "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" => Self::Image,
      "html" | "htm" => Self::Document,
      _ => Self::Empty,
    }
  }
}

impl FromStr for Destination {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "" | "empty" => Ok(Self::Empty),
      other => Err(eyre!("Unknown request destination: {}", other)),
    }
  }
}

/// An outgoing request as seen at the interception boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A top-level page navigation.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Stable cache identity: method plus absolute URL.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot. Cloning it is how a body is both cached and returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Success-range status.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Invalid header '{}': empty name", raw));
  }
  Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_depends_on_method_and_url() {
    let a = Request::get(url("http://localhost/api/quizzes"));
    let b = Request::get(url("http://localhost/api/quizzes"));
    let c = Request::new(Method::Head, url("http://localhost/api/quizzes"));
    let d = Request::get(url("http://localhost/api/notes"));

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert_ne!(a.cache_key(), d.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_destination_inference() {
    assert_eq!(Destination::infer(&url("http://h/static/js/bundle.js")), Destination::Script);
    assert_eq!(Destination::infer(&url("http://h/static/css/main.css")), Destination::Style);
    assert_eq!(Destination::infer(&url("http://h/logo192.png")), Destination::Image);
    assert_eq!(Destination::infer(&url("http://h/")), Destination::Document);
    assert_eq!(Destination::infer(&url("http://h/quiz/3")), Destination::Document);
    assert_eq!(Destination::infer(&url("http://h/manifest.json")), Destination::Empty);
  }

  #[test]
  fn test_method_parsing() {
    assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
    assert!("BREW".parse::<Method>().is_err());
    assert!(Method::Get.is_cacheable());
    assert!(!Method::Post.is_cacheable());
  }

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(200, "").ok());
    assert!(Response::new(204, "").ok());
    assert!(!Response::new(304, "").ok());
    assert!(!Response::new(500, "").ok());
  }

  #[test]
  fn test_parse_header() {
    let (name, value) = parse_header("Content-Type: application/json").unwrap();
    assert_eq!(name, "Content-Type");
    assert_eq!(value, "application/json");
    assert!(parse_header("no-colon").is_err());
    assert!(parse_header(": value").is_err());
  }
}
