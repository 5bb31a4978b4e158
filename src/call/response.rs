use serde::Serialize;
use std::fmt::Write;

/// Which of the three equivalent call-control documents a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Markup,
    Json,
    Text,
}

impl ResponseFormat {
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xml" | "twiml" | "markup" => Some(ResponseFormat::Markup),
            "json" => Some(ResponseFormat::Json),
            "text" | "txt" | "plain" => Some(ResponseFormat::Text),
            _ => None,
        }
    }

    fn from_accept(accept: &str) -> Option<Self> {
        let accept = accept.to_ascii_lowercase();
        if accept.contains("application/json") {
            Some(ResponseFormat::Json)
        } else if accept.contains("text/plain") {
            Some(ResponseFormat::Text)
        } else if accept.contains("xml") {
            Some(ResponseFormat::Markup)
        } else {
            None
        }
    }

    /// The query parameter wins over the Accept header.
    pub fn negotiate(param: Option<&str>, accept: Option<&str>) -> Self {
        param
            .and_then(Self::from_param)
            .or_else(|| accept.and_then(Self::from_accept))
            .unwrap_or_default()
    }

    pub fn as_param(&self) -> &'static str {
        match self {
            ResponseFormat::Markup => "xml",
            ResponseFormat::Json => "json",
            ResponseFormat::Text => "text",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseFormat::Markup => "application/xml",
            ResponseFormat::Json => "application/json",
            ResponseFormat::Text => "text/plain; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum Verb {
    Play {
        url: String,
    },
    Say {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Gather {
        action: String,
        timeout_secs: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Hangup,
}

impl Verb {
    pub fn say(text: impl Into<String>, language: Option<&str>) -> Self {
        Verb::Say {
            text: text.into(),
            language: language.map(str::to_string),
        }
    }
}

/// One call-control response: the verbs to run plus the reply text spoken
/// in this turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseDocument {
    pub text: String,
    pub actions: Vec<Verb>,
}

impl ResponseDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            actions: Vec::new(),
        }
    }

    pub fn push(mut self, verb: Verb) -> Self {
        self.actions.push(verb);
        self
    }

    pub fn gathers(&self) -> bool {
        self.actions
            .iter()
            .any(|verb| matches!(verb, Verb::Gather { .. }))
    }

    pub fn hangs_up(&self) -> bool {
        matches!(self.actions.last(), Some(Verb::Hangup))
    }

    pub fn render(&self, format: ResponseFormat) -> String {
        match format {
            ResponseFormat::Markup => self.to_markup(),
            ResponseFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            ResponseFormat::Text => self.text.clone(),
        }
    }

    pub fn to_markup(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n");
        for verb in &self.actions {
            // writes into a String cannot fail
            let _ = match verb {
                Verb::Play { url } => writeln!(out, "  <Play>{}</Play>", escape(url)),
                Verb::Say { text, language } => match language {
                    Some(lang) => writeln!(
                        out,
                        "  <Say language=\"{}\">{}</Say>",
                        escape(lang),
                        escape(text)
                    ),
                    None => writeln!(out, "  <Say>{}</Say>", escape(text)),
                },
                Verb::Gather {
                    action,
                    timeout_secs,
                    language,
                } => {
                    let lang = language
                        .as_deref()
                        .map(|l| format!(" language=\"{}\"", escape(l)))
                        .unwrap_or_default();
                    writeln!(
                        out,
                        "  <Gather input=\"speech\" action=\"{}\" method=\"POST\" timeout=\"{}\" speechTimeout=\"auto\"{}/>",
                        escape(action),
                        timeout_secs,
                        lang
                    )
                }
                Verb::Hangup => writeln!(out, "  <Hangup/>"),
            };
        }
        out.push_str("</Response>\n");
        out
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
