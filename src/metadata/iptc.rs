//! IPTC-IIM records inside a JPEG APP13 (Photoshop 3.0) segment.

/// Prefix of the APP13 segment contents.
pub(crate) const IPTC_HEADER: &[u8] = b"Photoshop 3.0\0";
const IPTC_8BIM: &[u8] = b"8BIM";
const IPTC_RESOURCE_ID: u16 = 0x0404;

const TAG_MARKER: u8 = 0x1C;
const RECORD_ENVELOPE: u8 = 1;
const RECORD_APPLICATION: u8 = 2;
const DATASET_CODED_CHARSET: u8 = 90;
const DATASET_RECORD_VERSION: u8 = 0;
pub(crate) const DATASET_KEYWORDS: u8 = 25;
pub(crate) const DATASET_CAPTION: u8 = 120;

/// IPTC limits Caption-Abstract to 2000 bytes.
const CAPTION_MAX_BYTES: usize = 2000;

/// ESC % G: declares the application record as UTF-8.
const UTF8_CHARSET: &[u8] = &[0x1B, 0x25, 0x47];

/// One IIM dataset (`record:dataset = value`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dataset {
    pub record: u8,
    pub tag: u8,
    pub value: Vec<u8>,
}

impl Dataset {
    fn new(record: u8, tag: u8, value: &[u8]) -> Self {
        Self {
            record,
            tag,
            value: value.to_vec(),
        }
    }

    pub fn is(&self, record: u8, tag: u8) -> bool {
        self.record == record && self.tag == tag
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.value).trim().to_string()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let len = self.value.len().min(0x7FFF);
        out.extend_from_slice(&[TAG_MARKER, self.record, self.tag]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&self.value[..len]);
    }
}

/// A Photoshop image resource block (`8BIM`) inside APP13.
struct Resource<'a> {
    id: u16,
    /// The whole block including header and padding.
    raw: &'a [u8],
    /// The resource payload.
    data: &'a [u8],
}

fn resources(app13: &[u8]) -> Vec<Resource<'_>> {
    let mut found = Vec::new();
    if !app13.starts_with(IPTC_HEADER) {
        return found;
    }

    let mut pos = IPTC_HEADER.len();
    while pos + 12 <= app13.len() {
        if &app13[pos..pos + 4] != IPTC_8BIM {
            break;
        }
        let id = u16::from_be_bytes([app13[pos + 4], app13[pos + 5]]);
        // Pascal name: length byte + name, padded to even
        let name_len = app13[pos + 6] as usize;
        let name_padded = if (name_len + 1) % 2 == 0 { name_len + 1 } else { name_len + 2 };
        let size_at = pos + 6 + name_padded;
        if size_at + 4 > app13.len() {
            break;
        }
        let size = u32::from_be_bytes([
            app13[size_at],
            app13[size_at + 1],
            app13[size_at + 2],
            app13[size_at + 3],
        ]) as usize;
        let data_start = size_at + 4;
        let data_end = (data_start + size).min(app13.len());
        let block_end = if size % 2 == 0 { data_start + size } else { data_start + size + 1 };
        let block_end = block_end.min(app13.len());

        found.push(Resource {
            id,
            raw: &app13[pos..block_end],
            data: &app13[data_start..data_end],
        });
        pos = block_end;
    }
    found
}

fn parse_datasets(data: &[u8]) -> Vec<Dataset> {
    let mut datasets = Vec::new();
    let mut pos = 0;
    while pos + 5 <= data.len() {
        if data[pos] != TAG_MARKER {
            break;
        }
        let record = data[pos + 1];
        let tag = data[pos + 2];
        let raw_len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
        let mut value_start = pos + 5;

        // Extended dataset: low bits give the size of the length field
        let len = if raw_len & 0x8000 != 0 {
            let len_size = raw_len & 0x7FFF;
            if len_size > 4 || value_start + len_size > data.len() {
                break;
            }
            let len = data[value_start..value_start + len_size]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            value_start += len_size;
            len
        } else {
            raw_len
        };

        let value_end = value_start + len;
        if value_end > data.len() {
            break;
        }
        datasets.push(Dataset::new(record, tag, &data[value_start..value_end]));
        pos = value_end;
    }
    datasets
}

/// All IIM datasets stored in an APP13 segment.
pub(crate) fn datasets(app13: &[u8]) -> Vec<Dataset> {
    resources(app13)
        .into_iter()
        .filter(|r| r.id == IPTC_RESOURCE_ID)
        .flat_map(|r| parse_datasets(r.data))
        .collect()
}

/// Caption-Abstract (2:120), if present and non-empty.
pub(crate) fn caption(app13: &[u8]) -> Option<String> {
    datasets(app13)
        .iter()
        .find(|d| d.is(RECORD_APPLICATION, DATASET_CAPTION))
        .map(Dataset::text)
        .filter(|s| !s.is_empty())
}

/// Keywords (2:25), in file order.
pub(crate) fn keywords(app13: &[u8]) -> Vec<String> {
    datasets(app13)
        .iter()
        .filter(|d| d.is(RECORD_APPLICATION, DATASET_KEYWORDS))
        .map(Dataset::text)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Build APP13 contents with Caption-Abstract set to `caption`.
///
/// Other Photoshop resources and every other IIM dataset of the existing
/// segment are carried over unchanged.
pub(crate) fn with_caption(existing: Option<&[u8]>, caption: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(IPTC_HEADER);

    let mut kept: Vec<Dataset> = Vec::new();
    if let Some(app13) = existing {
        for resource in resources(app13) {
            if resource.id == IPTC_RESOURCE_ID {
                kept.extend(parse_datasets(resource.data).into_iter().filter(|d| {
                    !d.is(RECORD_APPLICATION, DATASET_CAPTION)
                        && !d.is(RECORD_APPLICATION, DATASET_RECORD_VERSION)
                }));
            } else {
                out.extend_from_slice(resource.raw);
            }
        }
    }

    let mut records: Vec<Dataset> = Vec::with_capacity(kept.len() + 3);
    if !kept.iter().any(|d| d.is(RECORD_ENVELOPE, DATASET_CODED_CHARSET)) {
        records.push(Dataset::new(RECORD_ENVELOPE, DATASET_CODED_CHARSET, UTF8_CHARSET));
    }
    records.push(Dataset::new(RECORD_APPLICATION, DATASET_RECORD_VERSION, &[0x00, 0x04]));
    records.extend(kept);
    records.push(Dataset::new(
        RECORD_APPLICATION,
        DATASET_CAPTION,
        truncate_utf8(caption, CAPTION_MAX_BYTES).as_bytes(),
    ));
    // Records must appear in ascending record number; the sort is stable
    records.sort_by_key(|d| d.record);

    let mut iim = Vec::new();
    for record in &records {
        record.encode_into(&mut iim);
    }

    out.extend_from_slice(IPTC_8BIM);
    out.extend_from_slice(&IPTC_RESOURCE_ID.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]); // empty pascal name, padded
    out.extend_from_slice(&(iim.len() as u32).to_be_bytes());
    out.extend_from_slice(&iim);
    if iim.len() % 2 != 0 {
        out.push(0x00);
    }
    out
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(IPTC_8BIM);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x00, 0x00]);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 != 0 {
            out.push(0);
        }
        out
    }

    fn app13_with(datasets: &[Dataset], extra: Option<(u16, &[u8])>) -> Vec<u8> {
        let mut iim = Vec::new();
        for d in datasets {
            d.encode_into(&mut iim);
        }
        let mut out = IPTC_HEADER.to_vec();
        if let Some((id, data)) = extra {
            out.extend(resource(id, data));
        }
        out.extend(resource(IPTC_RESOURCE_ID, &iim));
        out
    }

    #[test]
    fn reads_caption_and_keywords() {
        let app13 = app13_with(
            &[
                Dataset::new(2, 0, &[0, 4]),
                Dataset::new(2, DATASET_KEYWORDS, b"beach"),
                Dataset::new(2, DATASET_KEYWORDS, b" sunset "),
                Dataset::new(2, DATASET_CAPTION, b"Evening at Malibu"),
            ],
            None,
        );
        assert_eq!(caption(&app13).as_deref(), Some("Evening at Malibu"));
        assert_eq!(keywords(&app13), vec!["beach", "sunset"]);
    }

    #[test]
    fn empty_caption_is_none() {
        let app13 = app13_with(&[Dataset::new(2, DATASET_CAPTION, b"   ")], None);
        assert!(caption(&app13).is_none());
    }

    #[test]
    fn not_photoshop_segment() {
        assert!(datasets(b"something else entirely").is_empty());
        assert!(caption(b"").is_none());
    }

    #[test]
    fn writes_caption_into_empty_segment() {
        let app13 = with_caption(None, "Kayaks on a lake");
        assert!(app13.starts_with(IPTC_HEADER));
        assert_eq!(caption(&app13).as_deref(), Some("Kayaks on a lake"));
        let sets = datasets(&app13);
        assert_eq!(sets[0], Dataset::new(1, DATASET_CODED_CHARSET, UTF8_CHARSET));
    }

    #[test]
    fn replaces_caption_and_keeps_keywords_and_resources() {
        let existing = app13_with(
            &[
                Dataset::new(1, DATASET_CODED_CHARSET, UTF8_CHARSET),
                Dataset::new(2, 0, &[0, 2]),
                Dataset::new(2, DATASET_KEYWORDS, b"lake"),
                Dataset::new(2, DATASET_CAPTION, b"old caption"),
            ],
            Some((0x03ED, b"resolution")),
        );

        let updated = with_caption(Some(&existing), "new caption");
        assert_eq!(caption(&updated).as_deref(), Some("new caption"));
        assert_eq!(keywords(&updated), vec!["lake"]);

        let sets = datasets(&updated);
        assert_eq!(sets.iter().filter(|d| d.is(2, DATASET_CAPTION)).count(), 1);
        assert_eq!(sets.iter().filter(|d| d.is(1, DATASET_CODED_CHARSET)).count(), 1);
        assert!(resources(&updated).iter().any(|r| r.id == 0x03ED && r.data == b"resolution"));
    }

    #[test]
    fn long_caption_truncated_on_char_boundary() {
        let caption_text = "é".repeat(1500); // 3000 bytes
        let app13 = with_caption(None, &caption_text);
        let stored = caption(&app13).unwrap();
        assert!(stored.len() <= CAPTION_MAX_BYTES);
        assert!(stored.chars().all(|c| c == 'é'));
    }

    #[test]
    fn extended_length_dataset() {
        let mut iim = vec![TAG_MARKER, 2, DATASET_CAPTION, 0x80, 0x02, 0x00, 0x03];
        iim.extend_from_slice(b"abc");
        let datasets = parse_datasets(&iim);
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].text(), "abc");
    }
}
