//! Lazy record stream over a raw response.
//!
//! Entities are located by their element tag wherever they sit in the
//! envelope, so export and import shaped responses read the same way.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::entities::project;
use super::tree::{empty_element, new_reader, read_element};
use super::NormalizeContext;
use crate::error::AppError;
use crate::models::{CanonicalRecord, EntityKind};

/// Pull-based iterator over the entities of one raw response.
///
/// Only the subtree of the entity being yielded is held in memory. The
/// iterator keeps no state beyond its position in `raw`; to start over,
/// build a new one from the same text.
pub struct RecordStream<'a> {
    raw: &'a str,
    reader: Reader<&'a [u8]>,
    kind: EntityKind,
    tag: &'static str,
    ctx: NormalizeContext,
    done: bool,
}

impl<'a> RecordStream<'a> {
    pub fn new(raw: &'a str, kind: EntityKind, ctx: NormalizeContext) -> Self {
        Self {
            raw,
            reader: new_reader(raw),
            kind,
            tag: kind.element_tag(),
            ctx,
            done: false,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    fn snippet(&self, from: usize, to: usize) -> Option<String> {
        let start = from + self.raw.get(from..)?.find('<')?;
        self.raw.get(start..to).map(str::to_string)
    }

    fn finish(&mut self, record: CanonicalRecord, from: usize) -> CanonicalRecord {
        let mut record = record;
        if record.is_malformed() {
            let to = self.reader.buffer_position() as usize;
            record.raw = self.snippet(from, to);
        }
        record
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<CanonicalRecord, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let before = self.reader.buffer_position() as usize;
            let event = match self.reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    self.done = true;
                    return Some(Err(AppError::XmlError(format!("at byte {}: {}", before, e))));
                }
            };

            match event {
                Event::Start(e) if e.name().as_ref() == self.tag.as_bytes() => {
                    let tree = match read_element(&mut self.reader, &e) {
                        Ok(tree) => tree,
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    };
                    let record = project(self.kind, &tree, &self.ctx);
                    return Some(Ok(self.finish(record, before)));
                }
                Event::Empty(e) if e.name().as_ref() == self.tag.as_bytes() => {
                    let tree = empty_element(&e);
                    let record = project(self.kind, &tree, &self.ctx);
                    return Some(Ok(self.finish(record, before)));
                }
                Event::Eof => {
                    self.done = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}
