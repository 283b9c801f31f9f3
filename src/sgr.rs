//! Select Graphic Rendition attributes.
//!
//! The screen records, for every cell, the list of SGR attributes in effect
//! when the cell was written. Attributes are kept in wire form rather than
//! materialized into a style struct so the scrollback emitter can replay
//! them byte-for-byte.

/// Whether a composite color applies to the foreground or the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorTarget {
    Foreground,
    Background,
}

/// A 256-color palette index or a 24-bit color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendedColor {
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// One parsed SGR directive from a `CSI ... m` sequence.
///
/// Either a primitive numeric parameter (bold, italic, 8/16-color
/// foreground or background, reset, ...) or a composite `38;5;n` /
/// `38;2;r;g;b` color directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgrAttribute {
    Primitive(u16),
    Extended {
        target: ColorTarget,
        color: ExtendedColor,
    },
}

/// Mutually-exclusive attribute groups: setting a new attribute in a
/// category evicts the previous attribute of the same category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgrCategory {
    Foreground,
    Background,
    Intensity,
    Italic,
    Underline,
    Blink,
    Inverse,
    Strike,
    /// Codes outside the taxonomy form singleton categories keyed by code.
    Other(u16),
}

/// The ordered attribute list applied to newly written cells.
/// Equality is positional; an empty list means "no attributes set".
pub type SgrList = Vec<SgrAttribute>;

impl SgrAttribute {
    /// True for a bare reset (`CSI 0 m` or `CSI m`).
    pub fn is_unset_all(&self) -> bool {
        matches!(self, SgrAttribute::Primitive(0))
    }

    /// The canonical byte form, `ESC [ params m`.
    pub fn to_csi(&self) -> Vec<u8> {
        match self {
            SgrAttribute::Primitive(n) => format!("\x1b[{n}m").into_bytes(),
            SgrAttribute::Extended { target, color } => {
                let base = match target {
                    ColorTarget::Foreground => 38,
                    ColorTarget::Background => 48,
                };
                match color {
                    ExtendedColor::Indexed(n) => format!("\x1b[{base};5;{n}m").into_bytes(),
                    ExtendedColor::Rgb(r, g, b) => {
                        format!("\x1b[{base};2;{r};{g};{b}m").into_bytes()
                    }
                }
            }
        }
    }

    pub fn category(&self) -> SgrCategory {
        match self {
            SgrAttribute::Extended { target, .. } => match target {
                ColorTarget::Foreground => SgrCategory::Foreground,
                ColorTarget::Background => SgrCategory::Background,
            },
            SgrAttribute::Primitive(code) => match code {
                30..=37 | 39 | 90..=97 => SgrCategory::Foreground,
                40..=47 | 49 | 100..=107 => SgrCategory::Background,
                1 | 2 | 22 => SgrCategory::Intensity,
                3 | 23 => SgrCategory::Italic,
                4 | 21 | 24 => SgrCategory::Underline,
                5 | 25 => SgrCategory::Blink,
                7 | 27 => SgrCategory::Inverse,
                9 | 29 => SgrCategory::Strike,
                other => SgrCategory::Other(*other),
            },
        }
    }

    /// Insert into `list`, evicting any prior attribute of the same category.
    pub fn add_to_list(&self, list: &mut SgrList) {
        let category = self.category();
        list.retain(|existing| existing.category() != category);
        list.push(*self);
    }
}

/// Parse the parameter list of a `CSI ... m` sequence into attributes.
///
/// `subs[i]` marks parameters introduced by a colon rather than a semicolon.
/// `38`/`48` consume their extended-color tail positionally; colon
/// sub-parameters attached to any other code are skipped.
pub fn attributes_from_params(params: &[u32], subs: &[bool]) -> Vec<SgrAttribute> {
    let mut out = Vec::new();
    let mut i = 0;

    while i < params.len() {
        let code = params[i];
        match code {
            38 | 48 => {
                let target = if code == 38 {
                    ColorTarget::Foreground
                } else {
                    ColorTarget::Background
                };
                if params.get(i + 1) == Some(&5) && i + 2 < params.len() {
                    out.push(SgrAttribute::Extended {
                        target,
                        color: ExtendedColor::Indexed(params[i + 2].min(255) as u8),
                    });
                    i += 3;
                } else if params.get(i + 1) == Some(&2) && i + 4 < params.len() {
                    out.push(SgrAttribute::Extended {
                        target,
                        color: ExtendedColor::Rgb(
                            params[i + 2].min(255) as u8,
                            params[i + 3].min(255) as u8,
                            params[i + 4].min(255) as u8,
                        ),
                    });
                    i += 5;
                } else {
                    // Truncated extended color; drop the directive.
                    i += 1;
                }
            }
            _ => {
                out.push(SgrAttribute::Primitive(code.min(u16::MAX as u32) as u16));
                i += 1;
                while i < params.len() && subs.get(i).copied().unwrap_or(false) {
                    i += 1;
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_all() {
        assert!(SgrAttribute::Primitive(0).is_unset_all());
        assert!(!SgrAttribute::Primitive(1).is_unset_all());
    }

    #[test]
    fn test_to_csi() {
        assert_eq!(SgrAttribute::Primitive(31).to_csi(), b"\x1b[31m");
        let indexed = SgrAttribute::Extended {
            target: ColorTarget::Foreground,
            color: ExtendedColor::Indexed(196),
        };
        assert_eq!(indexed.to_csi(), b"\x1b[38;5;196m");
        let rgb = SgrAttribute::Extended {
            target: ColorTarget::Background,
            color: ExtendedColor::Rgb(1, 2, 3),
        };
        assert_eq!(rgb.to_csi(), b"\x1b[48;2;1;2;3m");
    }

    #[test]
    fn test_category_replacement() {
        let mut list = SgrList::new();
        SgrAttribute::Primitive(31).add_to_list(&mut list);
        SgrAttribute::Primitive(1).add_to_list(&mut list);
        SgrAttribute::Primitive(32).add_to_list(&mut list);

        // The new foreground evicted the old one but left bold alone.
        assert_eq!(
            list,
            vec![SgrAttribute::Primitive(1), SgrAttribute::Primitive(32)]
        );
    }

    #[test]
    fn test_extended_color_evicts_primitive_foreground() {
        let mut list = SgrList::new();
        SgrAttribute::Primitive(31).add_to_list(&mut list);
        let extended = SgrAttribute::Extended {
            target: ColorTarget::Foreground,
            color: ExtendedColor::Indexed(5),
        };
        extended.add_to_list(&mut list);
        assert_eq!(list, vec![extended]);
    }

    #[test]
    fn test_parse_plain_params() {
        let attrs = attributes_from_params(&[1, 31], &[false, false]);
        assert_eq!(
            attrs,
            vec![SgrAttribute::Primitive(1), SgrAttribute::Primitive(31)]
        );
    }

    #[test]
    fn test_parse_extended_color_semicolons() {
        let attrs = attributes_from_params(&[38, 5, 196], &[false; 3]);
        assert_eq!(
            attrs,
            vec![SgrAttribute::Extended {
                target: ColorTarget::Foreground,
                color: ExtendedColor::Indexed(196),
            }]
        );
    }

    #[test]
    fn test_parse_rgb_with_trailing_param() {
        let attrs = attributes_from_params(&[48, 2, 10, 20, 30, 1], &[false; 6]);
        assert_eq!(
            attrs,
            vec![
                SgrAttribute::Extended {
                    target: ColorTarget::Background,
                    color: ExtendedColor::Rgb(10, 20, 30),
                },
                SgrAttribute::Primitive(1),
            ]
        );
    }

    #[test]
    fn test_parse_skips_sub_params_of_plain_codes() {
        // 4:3 (curly underline) keeps the underline code, drops the style.
        let attrs = attributes_from_params(&[4, 3, 1], &[false, true, false]);
        assert_eq!(
            attrs,
            vec![SgrAttribute::Primitive(4), SgrAttribute::Primitive(1)]
        );
    }

    #[test]
    fn test_parse_truncated_extended_color() {
        let attrs = attributes_from_params(&[38, 5], &[false, false]);
        assert_eq!(attrs, vec![SgrAttribute::Primitive(5)]);
    }
}
