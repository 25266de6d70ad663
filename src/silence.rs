//! SMBR silence handling (§4.4): transforms applied to the numerator posterior *before* it is
//! consumed as an accuracy target by [`crate::denominator_smbr::DenominatorSmbrComputation`].
//!
//! `parse_silence_pdfs` is kept separate from everything else in this module: it is the one
//! piece of string parsing the spec explicitly places outside the core (§1 Non-goals,
//! §6 "external collaborators convert this into the silence index vector"), so no driver or
//! computation type in this crate ever calls it — only `chain-tool` does.

use ndarray::Array2;

/// Applies `exclude_silence`: zeroes every silence column of `posterior`.
///
/// `sil_indices[i]` is `-1` at silence columns and `i` everywhere else, matching the
/// `CopyCols`-with-`-1`-yields-zero convention described in §4.4.
pub fn exclude_silence(posterior: &mut Array2<f64>, sil_indices: &[i32]) {
    for (pdf, &idx) in sil_indices.iter().enumerate() {
        if idx < 0 {
            for t in 0..posterior.nrows() {
                posterior[(t, pdf)] = 0.0;
            }
        }
    }
}

/// Applies `one_silence_class`: sums posterior mass across every silence column and broadcasts
/// the sum back into each of them, so all silence classes are treated as a single class.
pub fn one_silence_class(posterior: &mut Array2<f64>, sil_indices: &[i32]) {
    let silence_cols: Vec<usize> = sil_indices
        .iter()
        .enumerate()
        .filter(|(_, &idx)| idx < 0)
        .map(|(pdf, _)| pdf)
        .collect();
    if silence_cols.is_empty() {
        return;
    }
    for t in 0..posterior.nrows() {
        let sum: f64 = silence_cols.iter().map(|&pdf| posterior[(t, pdf)]).sum();
        for &pdf in &silence_cols {
            posterior[(t, pdf)] = sum;
        }
    }
}

/// Boundary helper (not part of the numerical core): parses a colon/comma separated string of
/// pdf-ids into the length-`num_pdfs` index vector the core expects, where entry `i` is `i` for
/// a kept class and `-1` for a silence class. Mirrors the style of `clap`-adjacent parsing
/// helpers the teacher keeps in its binaries rather than its library modules.
pub fn parse_silence_pdfs(silence_pdfs_str: &str, num_pdfs: usize) -> Vec<i32> {
    let mut indices: Vec<i32> = (0..num_pdfs as i32).collect();
    for tok in silence_pdfs_str.split(|c| c == ':' || c == ',') {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        if let Ok(pdf) = tok.parse::<usize>() {
            if pdf < num_pdfs {
                indices[pdf] = -1;
            }
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_silence_zeroes_silence_columns() {
        let mut posterior = Array2::from_elem((2, 3), 1.0);
        let sil = vec![0, -1, 2];
        exclude_silence(&mut posterior, &sil);
        assert_eq!(posterior[(0, 1)], 0.0);
        assert_eq!(posterior[(1, 1)], 0.0);
        assert_eq!(posterior[(0, 0)], 1.0);
        assert_eq!(posterior[(0, 2)], 1.0);
    }

    #[test]
    fn one_silence_class_broadcasts_sum() {
        let mut posterior = Array2::from_elem((1, 3), 0.0);
        posterior[(0, 1)] = 0.3;
        posterior[(0, 2)] = 0.2;
        let sil = vec![0, -1, -1];
        one_silence_class(&mut posterior, &sil);
        assert!((posterior[(0, 1)] - 0.5).abs() < 1e-12);
        assert!((posterior[(0, 2)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn parses_colon_and_comma_separated_indices() {
        let parsed = parse_silence_pdfs("1:3,5", 6);
        assert_eq!(parsed, vec![0, -1, 2, -1, 4, -1]);
    }
}
