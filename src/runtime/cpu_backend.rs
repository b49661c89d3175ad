//! Backend that executes an ASG on the CPU.
//!
//! Walks the dependencies of the requested outputs in topological order and
//! evaluates each node with `ndarray`. Shape problems surface as
//! `RuntimeError::ShapeError`; non-finite arithmetic results (0/0, x/0) are
//! ordinary values.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{broadcast_shapes, Asg, ConvPadding, NodeId, NodeType, Value};
use ndarray::{s, Array2, Array4, ArrayD, ArrayView4, Axis, Ix4, Slice, Zip};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

type Result<T> = std::result::Result<T, RuntimeError>;

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>> {
        Ok(data.clone())
    }

    fn run(
        &self,
        asg: &Asg,
        outputs: &[NodeId],
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>)> {
        let needed: HashSet<NodeId> = asg
            .ancestors(outputs)
            .map_err(|e| RuntimeError::ShapeError(format!("Dependency walk failed: {}", e)))?
            .into_iter()
            .collect();
        let sorted_nodes = ShapeInference::topological_sort(asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;

        let mut memo = initial_memo;
        for node_id in sorted_nodes.into_iter().filter(|id| needed.contains(id)) {
            if memo.contains_key(&node_id) {
                continue;
            }
            let node = asg.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id))?;
            let value = evaluate_node(node_id, &node.node_type, &memo)?;
            memo.insert(node_id, value);
        }

        let mut results = Vec::with_capacity(outputs.len());
        for output_id in outputs {
            let result = memo
                .get(output_id)
                .ok_or(RuntimeError::NodeNotFound(*output_id))?
                .clone();
            results.push(result);
        }
        Ok((results, memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>> {
        Ok(device_data.to_vec())
    }
}

fn evaluate_node(node_id: NodeId, node_type: &NodeType, memo: &Memo<Value>) -> Result<Value> {
    let arg = |id: NodeId| fetch(memo, id);

    let out = match node_type {
        NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node_id)),
        NodeType::Parameter { name } => return Err(RuntimeError::MissingParameter(name.clone(), node_id)),
        NodeType::Literal(value) => return Ok(value.clone()),

        NodeType::Add(l, r) => zip_broadcast(&*arg(*l)?, &*arg(*r)?, "Add", |a, b| a + b)?,
        NodeType::Subtract(l, r) => zip_broadcast(&*arg(*l)?, &*arg(*r)?, "Subtract", |a, b| a - b)?,
        NodeType::Multiply(l, r) => zip_broadcast(&*arg(*l)?, &*arg(*r)?, "Multiply", |a, b| a * b)?,
        NodeType::Divide(l, r) => zip_broadcast(&*arg(*l)?, &*arg(*r)?, "Divide", |a, b| a / b)?,
        NodeType::GreaterThan(l, r) => zip_broadcast(&*arg(*l)?, &*arg(*r)?, "GreaterThan", |a, b| {
            if a > b { 1.0 } else { 0.0 }
        })?,

        NodeType::Negate(x) => arg(*x)?.mapv(|v| -v),
        NodeType::Sqrt(x) => arg(*x)?.mapv(f32::sqrt),
        NodeType::ReLU(x) => arg(*x)?.mapv(|v| v.max(0.0)),
        NodeType::IsFinite(x) => arg(*x)?.mapv(|v| if v.is_finite() { 1.0 } else { 0.0 }),

        NodeType::Select { condition, on_true, on_false } => {
            op_select(&*arg(*condition)?, &*arg(*on_true)?, &*arg(*on_false)?)?
        }

        NodeType::Sum(x) => ndarray::arr0(arg(*x)?.sum()).into_dyn(),
        NodeType::SumAxis(x, axis) => {
            let a = arg(*x)?;
            check_axis("SumAxis", *axis, a.ndim())?;
            a.sum_axis(Axis(*axis))
        }
        NodeType::ExpandDims(x, axis) => {
            let a = arg(*x)?;
            check_axis("ExpandDims", *axis, a.ndim() + 1)?;
            a.into_owned().insert_axis(Axis(*axis))
        }
        NodeType::Slice { input, axis, start, length } => {
            let a = arg(*input)?;
            check_axis("Slice", *axis, a.ndim())?;
            let begin = resolve_start(*start, *length, a.shape()[*axis])?;
            a.slice_axis(Axis(*axis), Slice::from(begin..begin + length)).to_owned()
        }
        NodeType::Concat { inputs, axis } => {
            let parts = inputs.iter().map(|id| arg(*id)).collect::<Result<Vec<_>>>()?;
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            ndarray::concatenate(Axis(*axis), &views)
                .map_err(|e| RuntimeError::ShapeError(format!("Concat along axis {}: {}", axis, e)))?
        }
        NodeType::Broadcast(x, target) => op_broadcast(&*arg(*x)?, arg(*target)?.shape())?,
        NodeType::ReduceSumTo(x, target) => op_reduce_sum_to(arg(*x)?.into_owned(), arg(*target)?.shape())?,

        NodeType::Conv2d { input, filter, padding } => op_conv2d(&*arg(*input)?, &*arg(*filter)?, *padding)?,

        NodeType::SliceGrad { grad_output, input, axis, start, length } => {
            let g = arg(*grad_output)?;
            let shape = arg(*input)?.shape().to_vec();
            check_axis("SliceGrad", *axis, shape.len())?;
            let begin = resolve_start(*start, *length, shape[*axis])?;
            scatter_along_axis(&g, &shape, *axis, begin, *length)?
        }
        NodeType::ConcatGrad { grad_output, inputs, axis, index } => {
            let g = arg(*grad_output)?;
            let mut offset = 0;
            for id in inputs.iter().take(*index) {
                let part = arg(*id)?;
                check_axis("ConcatGrad", *axis, part.ndim())?;
                offset += part.shape()[*axis];
            }
            let own = inputs
                .get(*index)
                .ok_or_else(|| RuntimeError::ShapeError(format!("ConcatGrad index {} out of range", index)))?;
            let own = arg(*own)?;
            check_axis("ConcatGrad", *axis, own.ndim())?;
            let len = own.shape()[*axis];
            check_axis("ConcatGrad", *axis, g.ndim())?;
            if offset + len > g.shape()[*axis] {
                return Err(RuntimeError::ShapeError(format!(
                    "ConcatGrad: slice {}..{} exceeds gradient axis of length {}",
                    offset,
                    offset + len,
                    g.shape()[*axis]
                )));
            }
            g.slice_axis(Axis(*axis), Slice::from(offset..offset + len)).to_owned()
        }
        NodeType::Conv2dGradInput { grad_output, filter, input, padding } => {
            op_conv2d_grad_input(&*arg(*grad_output)?, &*arg(*filter)?, arg(*input)?.shape(), *padding)?
        }
        NodeType::Conv2dGradFilter { grad_output, input, filter, padding } => {
            op_conv2d_grad_filter(&*arg(*grad_output)?, &*arg(*input)?, arg(*filter)?.shape(), *padding)?
        }
    };

    Ok(Value::Tensor(out))
}

/// Operand value as an array; scalars become rank-0 arrays.
fn fetch(memo: &Memo<Value>, id: NodeId) -> Result<Cow<'_, ArrayD<f32>>> {
    match memo.get(&id) {
        Some(Value::Tensor(arr)) => Ok(Cow::Borrowed(arr)),
        Some(Value::ScalarF32(v)) => Ok(Cow::Owned(ndarray::arr0(*v).into_dyn())),
        None => Err(RuntimeError::NodeNotFound(id)),
    }
}

fn check_axis(op: &str, axis: usize, rank: usize) -> Result<()> {
    if axis >= rank {
        return Err(RuntimeError::ShapeError(format!("{}: axis {} out of range for rank {}", op, axis, rank)));
    }
    Ok(())
}

/// Resolves a possibly negative slice start against an axis of length `dim`.
fn resolve_start(start: isize, length: usize, dim: usize) -> Result<usize> {
    let begin = if start < 0 { dim as isize + start } else { start };
    if begin < 0 || begin as usize + length > dim {
        return Err(RuntimeError::ShapeError(format!(
            "Slice start {} length {} out of range for axis of length {}",
            start, length, dim
        )));
    }
    Ok(begin as usize)
}

fn zip_broadcast(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    op: &str,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        RuntimeError::ShapeError(format!("{}: cannot broadcast {:?} with {:?}", op, a.shape(), b.shape()))
    })?;
    let av = broadcast_view(a, &shape, op)?;
    let bv = broadcast_view(b, &shape, op)?;
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

fn broadcast_view<'a>(a: &'a ArrayD<f32>, shape: &[usize], op: &str) -> Result<ndarray::ArrayViewD<'a, f32>> {
    a.broadcast(shape)
        .ok_or_else(|| RuntimeError::ShapeError(format!("{}: cannot broadcast {:?} to {:?}", op, a.shape(), shape)))
}

fn op_select(condition: &ArrayD<f32>, on_true: &ArrayD<f32>, on_false: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let shape = broadcast_shapes(on_true.shape(), on_false.shape())
        .and_then(|branches| broadcast_shapes(condition.shape(), &branches))
        .ok_or_else(|| {
            RuntimeError::ShapeError(format!(
                "Select: cannot broadcast condition {:?}, branches {:?} and {:?}",
                condition.shape(),
                on_true.shape(),
                on_false.shape()
            ))
        })?;
    let c = broadcast_view(condition, &shape, "Select")?;
    let t = broadcast_view(on_true, &shape, "Select")?;
    let f = broadcast_view(on_false, &shape, "Select")?;
    Ok(Zip::from(c).and(t).and(f).map_collect(|&c, &t, &f| if c != 0.0 { t } else { f }))
}

fn op_broadcast(source: &ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    Ok(broadcast_view(source, target_shape, "Broadcast")?.to_owned())
}

/// Sums `source` over its broadcast axes until it has `target_shape`.
fn op_reduce_sum_to(mut source: ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    while source.ndim() > target_shape.len() {
        source = source.sum_axis(Axis(0));
    }
    if source.ndim() < target_shape.len() {
        source = op_broadcast(&source, target_shape)?;
    }
    for (i, &t) in target_shape.iter().enumerate() {
        if t == 1 && source.shape()[i] != 1 {
            source = source.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    if source.shape() != target_shape {
        return Err(RuntimeError::ShapeError(format!(
            "ReduceSumTo: cannot reduce {:?} to {:?}",
            source.shape(),
            target_shape
        )));
    }
    Ok(source)
}

/// Zeros of `shape` with `values` written at `begin..begin + length` along `axis`.
fn scatter_along_axis(
    values: &ArrayD<f32>,
    shape: &[usize],
    axis: usize,
    begin: usize,
    length: usize,
) -> Result<ArrayD<f32>> {
    let mut out = ArrayD::<f32>::zeros(shape);
    let mut window = out.slice_axis_mut(Axis(axis), Slice::from(begin..begin + length));
    if window.shape() != values.shape() {
        return Err(RuntimeError::ShapeError(format!(
            "SliceGrad: gradient {:?} does not match slice {:?}",
            values.shape(),
            window.shape()
        )));
    }
    window.assign(values);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Convolution (NHWC, filter [kH, kW, C_in, C_out], stride 1)
// ---------------------------------------------------------------------------

/// Sizes shared by the forward and both backward convolutions.
struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    in_c: usize,
    k_h: usize,
    k_w: usize,
    out_c: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
    padded_h: usize,
    padded_w: usize,
}

impl ConvGeometry {
    fn new(input: &[usize], filter: &[usize], padding: ConvPadding) -> Result<Self> {
        if input.len() != 4 || filter.len() != 4 {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d expects rank-4 input and filter, got {:?} and {:?}",
                input, filter
            )));
        }
        let (batch, in_h, in_w, in_c) = (input[0], input[1], input[2], input[3]);
        let (k_h, k_w, f_in, out_c) = (filter[0], filter[1], filter[2], filter[3]);
        if in_c != f_in {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d: input has {} channels, filter expects {}",
                in_c, f_in
            )));
        }
        let too_small = || {
            RuntimeError::ShapeError(format!("Conv2d: kernel {}x{} does not fit input {:?}", k_h, k_w, input))
        };
        let out_h = padding.output_len(in_h, k_h).ok_or_else(too_small)?;
        let out_w = padding.output_len(in_w, k_w).ok_or_else(too_small)?;
        let (pad_top, pad_bottom) = padding.pads(k_h);
        let (pad_left, pad_right) = padding.pads(k_w);

        Ok(Self {
            batch,
            in_h,
            in_w,
            in_c,
            k_h,
            k_w,
            out_c,
            out_h,
            out_w,
            pad_top,
            pad_left,
            padded_h: in_h + pad_top + pad_bottom,
            padded_w: in_w + pad_left + pad_right,
        })
    }

    /// Number of output pixels across the batch.
    fn rows(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    fn pad_input(&self, input: ArrayView4<f32>) -> Array4<f32> {
        let mut padded = Array4::<f32>::zeros((self.batch, self.padded_h, self.padded_w, self.in_c));
        padded
            .slice_mut(s![
                ..,
                self.pad_top..self.pad_top + self.in_h,
                self.pad_left..self.pad_left + self.in_w,
                ..
            ])
            .assign(&input);
        padded
    }

    /// Input patch seen by kernel tap (i, j), flattened to `[rows, C_in]`.
    fn window(&self, padded: &Array4<f32>, i: usize, j: usize) -> Result<Array2<f32>> {
        let view = padded.slice(s![.., i..i + self.out_h, j..j + self.out_w, ..]);
        Array2::from_shape_vec((self.rows(), self.in_c), view.iter().copied().collect())
            .map_err(|e| RuntimeError::ShapeError(format!("Conv2d window: {}", e)))
    }

    fn check_grad_output(&self, grad: &[usize]) -> Result<()> {
        let expected = [self.batch, self.out_h, self.out_w, self.out_c];
        if grad != expected {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d gradient has shape {:?}, expected {:?}",
                grad, expected
            )));
        }
        Ok(())
    }
}

fn as4<'a>(a: &'a ArrayD<f32>, what: &str) -> Result<ArrayView4<'a, f32>> {
    a.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: {}", what, e)))
}

fn as_rows(a: &ArrayD<f32>, rows: usize, cols: usize, what: &str) -> Result<Array2<f32>> {
    Array2::from_shape_vec((rows, cols), a.iter().copied().collect())
        .map_err(|e| RuntimeError::ShapeError(format!("{}: {}", what, e)))
}

fn op_conv2d(input: &ArrayD<f32>, filter: &ArrayD<f32>, padding: ConvPadding) -> Result<ArrayD<f32>> {
    let geo = ConvGeometry::new(input.shape(), filter.shape(), padding)?;
    let x = as4(input, "Conv2d input")?;
    let w = as4(filter, "Conv2d filter")?;
    let padded = geo.pad_input(x);

    let mut out = Array2::<f32>::zeros((geo.rows(), geo.out_c));
    for i in 0..geo.k_h {
        for j in 0..geo.k_w {
            let cols = geo.window(&padded, i, j)?;
            out += &cols.dot(&w.slice(s![i, j, .., ..]));
        }
    }

    out.into_shape_with_order((geo.batch, geo.out_h, geo.out_w, geo.out_c))
        .map(|a| a.into_dyn())
        .map_err(|e| RuntimeError::ShapeError(format!("Conv2d output: {}", e)))
}

fn op_conv2d_grad_input(
    grad_output: &ArrayD<f32>,
    filter: &ArrayD<f32>,
    input_shape: &[usize],
    padding: ConvPadding,
) -> Result<ArrayD<f32>> {
    let geo = ConvGeometry::new(input_shape, filter.shape(), padding)?;
    geo.check_grad_output(grad_output.shape())?;
    let w = as4(filter, "Conv2d filter")?;
    let dy = as_rows(grad_output, geo.rows(), geo.out_c, "Conv2d gradient")?;

    let mut d_padded = Array4::<f32>::zeros((geo.batch, geo.padded_h, geo.padded_w, geo.in_c));
    for i in 0..geo.k_h {
        for j in 0..geo.k_w {
            let contrib = dy
                .dot(&w.slice(s![i, j, .., ..]).t())
                .into_shape_with_order((geo.batch, geo.out_h, geo.out_w, geo.in_c))
                .map_err(|e| RuntimeError::ShapeError(format!("Conv2d input gradient: {}", e)))?;
            let mut window = d_padded.slice_mut(s![.., i..i + geo.out_h, j..j + geo.out_w, ..]);
            window += &contrib;
        }
    }

    Ok(d_padded
        .slice(s![
            ..,
            geo.pad_top..geo.pad_top + geo.in_h,
            geo.pad_left..geo.pad_left + geo.in_w,
            ..
        ])
        .to_owned()
        .into_dyn())
}

fn op_conv2d_grad_filter(
    grad_output: &ArrayD<f32>,
    input: &ArrayD<f32>,
    filter_shape: &[usize],
    padding: ConvPadding,
) -> Result<ArrayD<f32>> {
    let geo = ConvGeometry::new(input.shape(), filter_shape, padding)?;
    geo.check_grad_output(grad_output.shape())?;
    let padded = geo.pad_input(as4(input, "Conv2d input")?);
    let dy = as_rows(grad_output, geo.rows(), geo.out_c, "Conv2d gradient")?;

    let mut d_filter = Array4::<f32>::zeros((geo.k_h, geo.k_w, geo.in_c, geo.out_c));
    for i in 0..geo.k_h {
        for j in 0..geo.k_w {
            let cols = geo.window(&padded, i, j)?;
            let mut tap = d_filter.slice_mut(s![i, j, .., ..]);
            tap += &cols.t().dot(&dy);
        }
    }
    Ok(d_filter.into_dyn())
}
