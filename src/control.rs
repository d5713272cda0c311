// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file primitives.

Debian metadata (`control` files inside packages, `Packages` indices,
`Release` files) shares one syntax: paragraphs of `Name: value` fields
separated by blank lines, with continuation lines indented by whitespace.
See <https://www.debian.org/doc/debian-policy/ch-controlfields.html>.
*/

use {
    crate::error::{BuildError, Result},
    std::{borrow::Cow, io::BufRead},
};

/// A field in a control paragraph.
///
/// The value retains its original formatting, including newlines and the
/// leading whitespace of continuation lines.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlField<'a> {
    name: Cow<'a, str>,
    value: Cow<'a, str>,
}

impl<'a> ControlField<'a> {
    /// Construct an instance from a field name and value.
    pub fn new(name: Cow<'a, str>, value: Cow<'a, str>) -> Self {
        Self { name, value }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// The raw string value.
    pub fn value_str(&self) -> &str {
        self.value.as_ref()
    }

    /// Iterate over whitespace-delimited words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.as_ref().split_ascii_whitespace()
    }

    /// Iterate over lines in the value, leading whitespace stripped.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|x| x.trim_start())
    }
}

/// A paragraph in a control file.
///
/// An ordered series of fields. Field names are case insensitive on read and
/// case preserving on set. A paragraph holds at most one field per name.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlParagraph<'a> {
    fields: Vec<ControlField<'a>>,
}

impl<'a> ControlParagraph<'a> {
    /// Whether the paragraph has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set a field, replacing any existing field of the same name.
    pub fn set_field(&mut self, field: ControlField<'a>) {
        self.fields
            .retain(|f| !f.name.eq_ignore_ascii_case(&field.name));
        self.fields.push(field);
    }

    /// Set a field from name and value strings.
    pub fn set_field_from_string(&mut self, name: Cow<'a, str>, value: Cow<'a, str>) {
        self.set_field(ControlField::new(name, value));
    }

    /// Whether a named field is present.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField<'a>> {
        self.fields.iter()
    }

    /// Obtain the field with the given name.
    pub fn field(&self, name: &str) -> Option<&ControlField<'a>> {
        self.fields
            .iter()
            .find(|f| f.name.as_ref().eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the value of a field, evaluated as a boolean.
    ///
    /// The field is true iff its string value is `yes`.
    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.field_str(name).map(|v| matches!(v, "yes"))
    }

    /// Obtain the value of a field, parsed as a [u64].
    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name)
            .map(|v| v.parse::<u64>().map_err(BuildError::ParseInt))
    }

    /// Obtain the value of a required field.
    pub fn required_field_str(&self, name: &str) -> Result<&str> {
        self.field_str(name)
            .ok_or_else(|| BuildError::ControlRequiredFieldMissing(name.to_string()))
    }

    /// Iterate over whitespace-delimited words of the named field.
    pub fn field_iter_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_words())
    }

    /// Iterate over lines of the named field, leading whitespace stripped.
    pub fn field_iter_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_lines())
    }

    /// Render this paragraph back to control file syntax.
    pub fn to_control_string(&self) -> String {
        let mut s = String::new();

        for field in &self.fields {
            s.push_str(field.name());
            s.push_str(": ");
            s.push_str(field.value_str());
            s.push('\n');
        }

        s
    }
}

/// Holds parsing state for control files.
///
/// Fed lines of text; emits [ControlParagraph] instances as they complete.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph<'static>,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is
    /// returned. Otherwise `Ok(None)`.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph<'static>>> {
        let is_empty_line = line.trim().is_empty();
        let is_indented = (line.starts_with(' ') || line.starts_with('\t')) && line.len() > 1;

        let current_field = self.field.take();

        // Empty lines end a paragraph. Flush any state.
        if is_empty_line {
            if let Some(field) = current_field {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (current_field, is_indented) {
            // Unindented line while a field is on the stack: start of the next
            // field. Flush the previous one.
            (Some(v), false) => {
                self.flush_field(v)?;
                self.field = Some(line.to_string());
                Ok(None)
            }

            // First field of a paragraph.
            (None, _) => {
                self.field = Some(line.to_string());
                Ok(None)
            }

            // Continuation line of the current field.
            (Some(v), true) => {
                self.field = Some(v + line);
                Ok(None)
            }
        }
    }

    /// Finish parsing, consuming self.
    pub fn finish(mut self) -> Result<Option<ControlParagraph<'static>>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let (name, value) = v.split_once(':').ok_or_else(|| {
            BuildError::ControlParse(format!("error parsing line '{}'; missing colon", v))
        })?;

        self.paragraph.set_field_from_string(
            Cow::Owned(name.to_string()),
            Cow::Owned(value.trim().to_string()),
        );

        Ok(())
    }
}

/// An iterator of [ControlParagraph] read from a [BufRead].
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph<'static>>> {
        let mut parser = self.parser.take().expect("parser should be present");

        loop {
            let mut line = String::new();

            if self.reader.read_line(&mut line)? != 0 {
                if let Some(paragraph) = parser.write_line(&line)? {
                    self.parser.replace(parser);
                    return Ok(Some(paragraph));
                }
            } else {
                return parser.finish();
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            None
        } else {
            match self.get_next() {
                Ok(Some(para)) => Some(Ok(para)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        }
    }
}

/// Parse an entire control file from a string.
pub fn parse_control_paragraphs(s: &str) -> Result<Vec<ControlParagraph<'static>>> {
    ControlParagraphReader::new(std::io::Cursor::new(s.as_bytes())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_semantics() {
        let mut p = ControlParagraph::default();

        p.set_field_from_string("foo".into(), "bar".into());
        p.set_field_from_string("foo".into(), "baz".into());
        assert_eq!(p.field_str("foo"), Some("baz"));

        // Different case replaces too, and lookup is case insensitive.
        p.set_field_from_string("FOO".into(), "bar".into());
        assert_eq!(p.field_str("foo"), Some("bar"));
        assert_eq!(p.field_str("FOO"), Some("bar"));
    }

    #[test]
    fn parse_paragraphs() -> Result<()> {
        let s = "Package: busybox\nVersion: 1.30.1-7\nDescription: tiny utilities\n in a single binary.\n\nPackage: dash\nVersion: 0.5.11\n";

        let paras = parse_control_paragraphs(s)?;
        assert_eq!(paras.len(), 2);

        assert_eq!(paras[0].field_str("Package"), Some("busybox"));
        assert_eq!(
            paras[0].field_str("Description"),
            Some("tiny utilities\n in a single binary.")
        );
        assert_eq!(
            paras[0]
                .field_iter_lines("Description")
                .unwrap()
                .collect::<Vec<_>>(),
            vec!["tiny utilities", "in a single binary."]
        );
        assert_eq!(paras[1].field_str("Package"), Some("dash"));

        Ok(())
    }

    #[test]
    fn missing_colon_is_error() {
        let res = parse_control_paragraphs("not a field\n");
        assert!(matches!(res, Err(BuildError::ControlParse(_))));
    }

    #[test]
    fn boolean_field() -> Result<()> {
        let paras = parse_control_paragraphs("Package: a\nEssential: yes\n")?;
        assert_eq!(paras[0].field_bool("Essential"), Some(true));
        assert_eq!(paras[0].field_bool("Missing"), None);

        Ok(())
    }
}
