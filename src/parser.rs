use crate::config::MAIN_NAMESPACE;
use crate::error::IngestError;
use crate::models::RawPage;
use crate::source;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;
use tracing::warn;

/// Forward-only iterator over the `<page>` elements of a MediaWiki export.
///
/// Only the current page and the reader's internal buffer are held in memory, so the
/// dump size does not matter. Text content is kept verbatim (no trimming). The first
/// error ends the iteration; a new reader is needed to parse again.
pub struct WikiReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    text_buf: String,
    /// `None` accepts every namespace
    namespaces: Option<HashSet<String>>,
    finished: bool,
}

#[derive(Debug, Default)]
struct PartialPage {
    title: Option<String>,
    namespace: Option<String>,
    page_id: Option<String>,
    text: Option<String>,
    redirect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Namespace,
    PageId,
    Text,
}

/// Which page field an element feeds, given its parent inside `<page>`.
/// `<id>` only counts directly under `<page>`; revision and contributor ids are ignored.
fn field_for(parent: Option<&str>, name: &str) -> Option<Field> {
    match (parent, name) {
        (None, "title") => Some(Field::Title),
        (None, "ns") => Some(Field::Namespace),
        (None, "id") => Some(Field::PageId),
        (Some("revision"), "text") => Some(Field::Text),
        _ => None,
    }
}

impl WikiReader<Box<dyn BufRead + Send>> {
    /// Opens a (possibly bzip2-compressed) dump, keeping main-namespace pages only.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        Ok(Self::from_reader(source::open(path)?))
    }
}

impl<R: BufRead> WikiReader<R> {
    pub fn from_reader(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(false);
        reader.check_end_names(true);
        Self {
            reader,
            buf: Vec::with_capacity(8192),
            text_buf: String::new(),
            namespaces: Some(HashSet::from([MAIN_NAMESPACE.to_string()])),
            finished: false,
        }
    }

    /// Emit pages from every namespace instead of articles only.
    pub fn with_all_namespaces(mut self) -> Self {
        self.namespaces = None;
        self
    }

    fn accepts(&self, page: &RawPage) -> bool {
        match &self.namespaces {
            Some(allowed) => allowed.contains(&page.namespace),
            None => true,
        }
    }

    fn malformed(&self, detail: impl std::fmt::Display) -> IngestError {
        IngestError::MalformedSource(format!(
            "{detail} (near byte {})",
            self.reader.buffer_position()
        ))
    }

    /// Reads events until the next `</page>`, or returns `Ok(None)` at end of input.
    fn next_page(&mut self) -> Result<Option<RawPage>, IngestError> {
        let mut current: Option<PartialPage> = None;
        let mut stack: Vec<String> = Vec::new();
        let mut capturing: Option<Field> = None;

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    let detail = e.to_string();
                    return Err(self.malformed(detail));
                }
            };

            match event {
                Event::Start(ref e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if name == "page" {
                        current = Some(PartialPage::default());
                        stack.clear();
                        capturing = None;
                    } else if current.is_some() {
                        capturing = field_for(stack.last().map(String::as_str), &name);
                        if capturing.is_some() {
                            self.text_buf.clear();
                        }
                        stack.push(name);
                    }
                }
                Event::Empty(ref e) => {
                    if let Some(page) = current.as_mut() {
                        let name = e.local_name();
                        let parent = stack.last().map(String::as_str);
                        match (parent, name.as_ref()) {
                            (None, b"redirect") => page.redirect = true,
                            (Some("revision"), b"text") => page.text = Some(String::new()),
                            _ => {}
                        }
                    }
                }
                Event::Text(ref e) => {
                    if capturing.is_some() {
                        match e.unescape() {
                            Ok(text) => self.text_buf.push_str(&text),
                            Err(err) => {
                                let detail = err.to_string();
                                return Err(self.malformed(detail));
                            }
                        }
                    }
                }
                Event::CData(ref e) => {
                    if capturing.is_some() {
                        self.text_buf.push_str(&String::from_utf8_lossy(e));
                    }
                }
                Event::End(ref e) => {
                    let Some(page) = current.as_mut() else {
                        continue;
                    };
                    if e.local_name().as_ref() == b"page" {
                        if let Some(raw) = finish_page(current.take().unwrap_or_default()) {
                            return Ok(Some(raw));
                        }
                        stack.clear();
                        continue;
                    }
                    stack.pop();
                    if let Some(field) = capturing.take() {
                        let value = std::mem::take(&mut self.text_buf);
                        match field {
                            Field::Title => page.title = Some(value),
                            Field::Namespace => page.namespace = Some(value.trim().to_string()),
                            Field::PageId => page.page_id = Some(value.trim().to_string()),
                            Field::Text => page.text = Some(value),
                        }
                    }
                }
                Event::Eof => {
                    if current.is_some() {
                        return Err(self.malformed("input ended inside <page>"));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

fn finish_page(page: PartialPage) -> Option<RawPage> {
    let title = match page.title {
        Some(t) if !t.trim().is_empty() => t,
        _ => {
            warn!(page_id = ?page.page_id, "Dropping page without a title");
            return None;
        }
    };
    Some(RawPage {
        title,
        // Pre-0.5 export schemas have no <ns>; their pages are articles
        namespace: page
            .namespace
            .unwrap_or_else(|| MAIN_NAMESPACE.to_string()),
        page_id: page.page_id.filter(|id| !id.is_empty()),
        wiki_text: page.text.unwrap_or_default(),
        redirect: page.redirect,
    })
}

impl<R: BufRead> Iterator for WikiReader<R> {
    type Item = Result<RawPage, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.next_page() {
                Ok(Some(page)) => {
                    if self.accepts(&page) {
                        return Some(Ok(page));
                    }
                }
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
