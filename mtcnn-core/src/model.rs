//! ONNX-backed implementations of the cascade's inference backends.
//!
//! The three networks load once at detector construction; a missing or
//! unparsable model file is a fatal construction error. The proposal graph
//! runs on a different input size at every pyramid level, so it stays
//! decluttered rather than optimized for a fixed shape; the crop networks
//! try the optimized plan first and fall back to the decluttered graph.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use ndarray::{Array2, Array3, Array4};
use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact, TypedOp, tvec,
};

use crate::backend::{ProposalBackend, ProposalMaps, StageBackend, StageOutput};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// The proposal network: fully convolutional, scanned over every pyramid
/// level.
#[derive(Debug)]
pub struct ProposalNet {
    runnable: RunnableModel,
}

impl ProposalNet {
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();
        // Pyramid levels vary in size, so the graph keeps its symbolic
        // input shape instead of being optimized for a fixed one.
        let runnable = load_runnable_model(path, false)?;
        debug!("proposal model {} loaded", path.display());
        Ok(Self { runnable })
    }
}

impl ProposalBackend for ProposalNet {
    fn infer(&self, image: &Array3<f32>) -> Result<ProposalMaps> {
        let (channels, height, width) = image.dim();
        anyhow::ensure!(
            channels == 3,
            "proposal input must have 3 channels, got {channels}"
        );
        let tensor = tensor_from_chw(image, &[1, 3, height, width])?;
        let outputs = run_model(&self.runnable, tensor)?;
        proposal_maps_from(&outputs)
    }
}

/// The refine network: 24x24 crops in, scores and regressions out.
#[derive(Debug)]
pub struct RefineNet {
    runnable: RunnableModel,
}

impl RefineNet {
    pub const INPUT_SIZE: u32 = 24;

    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let runnable = load_optimized_with_fallback(model_path.as_ref())?;
        Ok(Self { runnable })
    }
}

impl StageBackend for RefineNet {
    fn input_size(&self) -> u32 {
        Self::INPUT_SIZE
    }

    fn infer(&self, batch: &Array4<f32>) -> Result<StageOutput> {
        run_stage(&self.runnable, batch, Self::INPUT_SIZE, false)
    }
}

/// The output network: 48x48 crops in, scores, regressions, and landmarks
/// out.
#[derive(Debug)]
pub struct OutputNet {
    runnable: RunnableModel,
}

impl OutputNet {
    pub const INPUT_SIZE: u32 = 48;

    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let runnable = load_optimized_with_fallback(model_path.as_ref())?;
        Ok(Self { runnable })
    }
}

impl StageBackend for OutputNet {
    fn input_size(&self) -> u32 {
        Self::INPUT_SIZE
    }

    fn infer(&self, batch: &Array4<f32>) -> Result<StageOutput> {
        run_stage(&self.runnable, batch, Self::INPUT_SIZE, true)
    }
}

fn load_runnable_model(path: &Path, optimized: bool) -> Result<RunnableModel> {
    anyhow::ensure!(path.exists(), "model file not found: {}", path.display());

    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    }
}

fn load_optimized_with_fallback(path: &Path) -> Result<RunnableModel> {
    match load_runnable_model(path, true) {
        Ok(model) => {
            debug!("model {} optimized successfully", path.display());
            Ok(model)
        }
        Err(opt_err) => {
            warn!(
                "model {} failed optimized load ({opt_err}); falling back to decluttered graph",
                path.display()
            );
            load_runnable_model(path, false).with_context(|| {
                format!(
                    "fallback to decluttered graph failed for {} after optimize error: {opt_err}",
                    path.display()
                )
            })
        }
    }
}

fn run_model(runnable: &RunnableModel, input: Tensor) -> Result<Vec<Tensor>> {
    let outputs = runnable
        .run(tvec![input.into()])
        .map_err(|e| anyhow::anyhow!("model execution failed: {e}"))?;
    Ok(outputs.into_iter().map(|v| v.into_tensor()).collect())
}

fn tensor_from_chw(data: &Array3<f32>, shape: &[usize]) -> Result<Tensor> {
    let standard = data.as_standard_layout();
    let slice = standard
        .as_slice()
        .context("input tensor is not contiguous")?;
    Tensor::from_shape(shape, slice).map_err(|e| anyhow::anyhow!("failed to build tensor: {e}"))
}

fn run_stage(
    runnable: &RunnableModel,
    batch: &Array4<f32>,
    input_size: u32,
    expect_landmarks: bool,
) -> Result<StageOutput> {
    let (count, channels, height, width) = batch.dim();
    anyhow::ensure!(
        channels == 3 && height == input_size as usize && width == input_size as usize,
        "stage batch must be [n, 3, {input_size}, {input_size}], got [{count}, {channels}, {height}, {width}]"
    );

    let standard = batch.as_standard_layout();
    let slice = standard
        .as_slice()
        .context("batch tensor is not contiguous")?;
    let tensor = Tensor::from_shape(&[count, 3, input_size as usize, input_size as usize], slice)
        .map_err(|e| anyhow::anyhow!("failed to build batch tensor: {e}"))?;

    let outputs = run_model(runnable, tensor)?;
    stage_output_from(&outputs, expect_landmarks)
}

/// Sort the proposal model's outputs into score and regression maps.
///
/// Outputs are identified by channel arity: `[1, 2, h, w]` carries the
/// two-class scores (channel 1 is face probability), `[1, 4, h, w]` the box
/// regressions. Anything else is a malformed backend.
fn proposal_maps_from(outputs: &[Tensor]) -> Result<ProposalMaps> {
    let mut scores = None;
    let mut regressions = None;

    for tensor in outputs {
        match *tensor.shape() {
            [1, 2, rows, cols] => {
                let data = tensor
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("proposal scores are not f32: {e}"))?;
                let plane = rows * cols;
                let face_channel = data[plane..2 * plane].to_vec();
                scores = Some(
                    Array2::from_shape_vec((rows, cols), face_channel)
                        .map_err(|e| anyhow::anyhow!("bad score map layout: {e}"))?,
                );
            }
            [1, 4, rows, cols] => {
                let data = tensor
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("proposal regressions are not f32: {e}"))?;
                let plane = rows * cols;
                regressions = Some(Array3::from_shape_fn((rows, cols, 4), |(r, c, k)| {
                    data[k * plane + r * cols + c]
                }));
            }
            ref other => anyhow::bail!("unexpected proposal output shape {:?}", other),
        }
    }

    Ok(ProposalMaps {
        scores: scores.context("proposal model produced no score map")?,
        regressions: regressions.context("proposal model produced no regression map")?,
    })
}

/// Sort a crop model's outputs into scores, regressions, and (for the
/// output stage) landmarks, identified by their trailing dimension.
fn stage_output_from(outputs: &[Tensor], expect_landmarks: bool) -> Result<StageOutput> {
    let mut scores = None;
    let mut regressions = None;
    let mut landmarks = None;

    for tensor in outputs {
        match *tensor.shape() {
            [count, 2] => {
                let data = tensor
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("stage scores are not f32: {e}"))?;
                scores = Some((0..count).map(|i| data[i * 2 + 1]).collect::<Vec<f32>>());
            }
            [count, 4] => {
                let data = tensor
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("stage regressions are not f32: {e}"))?;
                regressions = Some(
                    Array2::from_shape_vec((count, 4), data.to_vec())
                        .map_err(|e| anyhow::anyhow!("bad regression layout: {e}"))?,
                );
            }
            [count, 10] if expect_landmarks => {
                let data = tensor
                    .as_slice::<f32>()
                    .map_err(|e| anyhow::anyhow!("stage landmarks are not f32: {e}"))?;
                landmarks = Some(
                    Array2::from_shape_vec((count, 10), data.to_vec())
                        .map_err(|e| anyhow::anyhow!("bad landmark layout: {e}"))?,
                );
            }
            ref other => anyhow::bail!("unexpected stage output shape {:?}", other),
        }
    }

    if expect_landmarks {
        anyhow::ensure!(
            landmarks.is_some(),
            "output model produced no landmark tensor"
        );
    }

    Ok(StageOutput {
        scores: scores.context("stage model produced no score tensor")?,
        regressions: regressions.context("stage model produced no regression tensor")?,
        landmarks,
    })
}
