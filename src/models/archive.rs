//! Multi-object archive requests: `/(tok/a.txt,tok2/b.png).tar.gz`.

use super::object_key::{KeyRejection, ObjectKey};

/// Container format of an archive download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "application/x-gzip",
            ArchiveFormat::Zip => "application/zip",
        }
    }

    /// Split a request path into its member list and format.
    ///
    /// Recognized when the list is wrapped in parentheses, or when it names
    /// more than one member. `tok/file.tar.gz` on its own is an ordinary
    /// object and yields `None`.
    pub fn split_request_path(path: &str) -> Option<(&str, ArchiveFormat)> {
        let path = path.strip_prefix('/').unwrap_or(path);
        for format in [ArchiveFormat::TarGz, ArchiveFormat::Zip] {
            let Some(list) = path.strip_suffix(format.extension()) else {
                continue;
            };
            if let Some(inner) = list.strip_prefix('(').and_then(|l| l.strip_suffix(')')) {
                return Some((inner, format));
            }
            if list.contains(',') {
                return Some((list, format));
            }
        }
        None
    }
}

/// Ordered list of objects to bundle into one archive.
///
/// Duplicates are kept and order is preserved in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    members: Vec<ObjectKey>,
}

impl ArchiveRequest {
    /// Parse a comma-separated list of `token/name` references.
    pub fn parse(list: &str) -> Result<Self, KeyRejection> {
        let members = list
            .split(',')
            .map(ObjectKey::parse_reference)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { members })
    }

    pub fn from_keys(members: Vec<ObjectKey>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[ObjectKey] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parenthesized_lists_are_archives() {
        let (list, format) = ArchiveFormat::split_request_path("/(a/x.txt).zip").unwrap();
        assert_eq!(list, "a/x.txt");
        assert_eq!(format, ArchiveFormat::Zip);

        let (list, format) =
            ArchiveFormat::split_request_path("(a/x.txt,b/y.txt).tar.gz").unwrap();
        assert_eq!(list, "a/x.txt,b/y.txt");
        assert_eq!(format, ArchiveFormat::TarGz);
    }

    #[test]
    fn comma_lists_do_not_need_parentheses() {
        let (list, format) = ArchiveFormat::split_request_path("a/x.txt,b/y.txt.zip").unwrap();
        assert_eq!(list, "a/x.txt,b/y.txt");
        assert_eq!(format, ArchiveFormat::Zip);
    }

    #[test]
    fn single_object_with_archive_extension_is_not_an_archive() {
        assert!(ArchiveFormat::split_request_path("tok/backup.tar.gz").is_none());
        assert!(ArchiveFormat::split_request_path("tok/photos.zip").is_none());
    }

    #[test]
    fn parse_keeps_order_and_duplicates() {
        let request = ArchiveRequest::parse("t1/b.txt,t2/a.txt,t1/b.txt").unwrap();
        let names: Vec<_> = request.members().iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["t1/b.txt", "t2/a.txt", "t1/b.txt"]);
    }

    #[test]
    fn parse_rejects_malformed_members() {
        assert!(ArchiveRequest::parse("t1/a.txt,broken").is_err());
        assert!(ArchiveRequest::parse("").is_err());
    }
}
