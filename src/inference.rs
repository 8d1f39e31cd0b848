use ndarray::{Array2, ArrayView4};
use tracing::debug;

use crate::errors::{CutoutError, Result};
use crate::preprocess::LetterboxGeometry;
use crate::session::ReadySession;
use crate::traits::NamedOutput;

/// Runs one forward pass and returns the `target_size`² mask plane.
///
/// `None` means no session has been built yet. Runtime faults from the
/// session are returned as-is for the caller to handle.
pub fn run_inference(
    session: Option<&mut ReadySession>,
    tensor: ArrayView4<f32>,
    geometry: &LetterboxGeometry,
    output_candidates: &[String],
) -> Result<Array2<f32>> {
    let ready = session.ok_or(CutoutError::SessionNotReady)?;
    let outputs = ready.session_mut().run(tensor)?;
    let mask = select_mask(outputs, geometry.plane_len(), output_candidates)?;

    let side = geometry.target_size as usize;
    let plane: Vec<f32> = mask.data.into_iter().collect();
    Ok(Array2::from_shape_vec((side, side), plane)?)
}

/// Picks the mask among the model outputs.
///
/// Named candidates are probed first, in order, then every output in
/// declaration order; the first with exactly `expected` elements wins.
/// Models are free to rename outputs, so the element count is what decides.
pub fn select_mask(
    outputs: Vec<NamedOutput>,
    expected: usize,
    output_candidates: &[String],
) -> Result<NamedOutput> {
    let by_name = output_candidates.iter().find_map(|name| {
        outputs
            .iter()
            .position(|o| &o.name == name && o.len() == expected)
    });
    let index = by_name.or_else(|| outputs.iter().position(|o| o.len() == expected));

    match index {
        Some(i) => {
            let mut outputs = outputs;
            let chosen = outputs.swap_remove(i);
            debug!(output = %chosen.name, "selected mask output");
            Ok(chosen)
        }
        None => Err(CutoutError::MaskOutputMissing { expected }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, ArrayD, IxDyn};

    fn output(name: &str, shape: &[usize], value: f32) -> NamedOutput {
        NamedOutput::new(name, ArrayD::from_elem(IxDyn(shape), value))
    }

    #[test]
    fn test_missing_session() {
        let tensor = Array4::<f32>::zeros((1, 3, 8, 8));
        let geometry = LetterboxGeometry::fit(8, 8, 8);
        let result = run_inference(None, tensor.view(), &geometry, &[]);
        assert!(matches!(result, Err(CutoutError::SessionNotReady)));
    }

    #[test]
    fn test_named_candidate_wins_over_declaration_order() -> Result<()> {
        let outputs = vec![
            output("d1", &[1, 1, 4, 4], 0.1),
            output("d0", &[1, 1, 4, 4], 0.9),
        ];
        let chosen = select_mask(outputs, 16, &["d0".to_string()])?;
        assert_eq!(chosen.name, "d0");
        Ok(())
    }

    #[test]
    fn test_falls_back_to_element_count() -> Result<()> {
        let outputs = vec![
            output("features", &[1, 8, 2, 2], 0.0),
            output("alpha", &[1, 1, 4, 4], 0.5),
        ];
        // the named candidate exists but has the wrong size
        let chosen = select_mask(outputs, 16, &["features".to_string()])?;
        assert_eq!(chosen.name, "alpha");
        Ok(())
    }

    #[test]
    fn test_no_matching_output() {
        let outputs = vec![output("logits", &[10], 0.0)];
        assert!(matches!(
            select_mask(outputs, 16, &[]),
            Err(CutoutError::MaskOutputMissing { expected: 16 })
        ));
    }
}
