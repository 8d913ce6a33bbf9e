//! Dense row-major `f64` tensor, the value type chunks of tensor tileables hold.

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// One component of an index expression applied to a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexItem {
    /// `start:stop:step` with Python-style negative and open bounds.
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    /// Picks one position and drops the axis.
    Int(i64),
    /// Fancy indexing by explicit positions.
    Array(Vec<i64>),
    /// Boolean mask over the axis.
    Mask(Vec<bool>),
}

impl IndexItem {
    pub fn full() -> Self {
        IndexItem::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    pub fn range(start: i64, stop: i64) -> Self {
        IndexItem::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    pub fn start_at(start: i64) -> Self {
        IndexItem::Slice {
            start: Some(start),
            stop: None,
            step: None,
        }
    }

    pub fn stop_at(stop: i64) -> Self {
        IndexItem::Slice {
            start: None,
            stop: Some(stop),
            step: None,
        }
    }

    /// Plain items are slices and integers; everything else is fancy indexing.
    pub fn is_plain(&self) -> bool {
        matches!(self, IndexItem::Slice { .. } | IndexItem::Int(_))
    }

    fn positions(&self, axis: usize, size: usize) -> Result<Vec<usize>, DataError> {
        match self {
            IndexItem::Slice { start, stop, step } => slice_positions(*start, *stop, *step, size),
            IndexItem::Int(i) => Ok(vec![normalize(*i, axis, size)?]),
            IndexItem::Array(items) => items.iter().map(|i| normalize(*i, axis, size)).collect(),
            IndexItem::Mask(mask) => {
                if mask.len() != size {
                    return Err(DataError::MaskLength {
                        mask: mask.len(),
                        axis,
                        size,
                    });
                }
                Ok(mask
                    .iter()
                    .enumerate()
                    .filter_map(|(i, keep)| keep.then_some(i))
                    .collect())
            }
        }
    }

    /// Output length along the axis when it can be known without the data.
    pub fn output_len(&self, size: Option<usize>) -> Option<usize> {
        match self {
            IndexItem::Int(_) => None,
            IndexItem::Array(items) => Some(items.len()),
            IndexItem::Mask(_) => None,
            IndexItem::Slice { start, stop, step } => {
                size.and_then(|s| slice_positions(*start, *stop, *step, s).ok().map(|p| p.len()))
            }
        }
    }
}

fn normalize(index: i64, axis: usize, size: usize) -> Result<usize, DataError> {
    let resolved = if index < 0 { index + size as i64 } else { index };
    if resolved < 0 || resolved >= size as i64 {
        return Err(DataError::IndexOutOfBounds { index, axis, size });
    }
    Ok(resolved as usize)
}

fn slice_positions(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    size: usize,
) -> Result<Vec<usize>, DataError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(DataError::ZeroStep);
    }
    let len = size as i64;
    let adjust = |v: i64, lower: i64, upper: i64| {
        let v = if v < 0 { v + len } else { v };
        v.clamp(lower, upper)
    };
    let mut out = Vec::new();
    if step > 0 {
        let mut i = start.map_or(0, |s| adjust(s, 0, len));
        let end = stop.map_or(len, |s| adjust(s, 0, len));
        while i < end {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let mut i = start.map_or(len - 1, |s| adjust(s, -1, len - 1));
        let end = stop.map_or(-1, |s| adjust(s, -1, len - 1));
        while i > end {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// Wire form of a [`Tensor`], checked through [`Tensor::new`] on decode.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = DataError;

    fn try_from(raw: RawTensor) -> Result<Self, DataError> {
        Tensor::new(raw.shape, raw.data)
    }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, DataError> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))
            .unwrap_or(usize::MAX);
        if expected != data.len() {
            return Err(DataError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn full(shape: &[usize], value: f64) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn nbytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f64>()) as u64
    }

    pub fn add_scalar(&self, value: f64) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| v + value).collect(),
        }
    }

    /// Joins `pieces` along `axis`; every other extent must agree.
    pub fn concatenate(pieces: &[Tensor], axis: usize) -> Result<Tensor, DataError> {
        let first = pieces.first().ok_or(DataError::Empty)?;
        if axis >= first.ndim() {
            return Err(DataError::Concatenate {
                axis,
                reason: format!("tensor only has {} dimensions", first.ndim()),
            });
        }
        for piece in &pieces[1..] {
            let compatible = piece.ndim() == first.ndim()
                && piece
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(DataError::Concatenate {
                    axis,
                    reason: format!("shape {:?} does not match {:?}", piece.shape, first.shape),
                });
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();
        let mut shape = first.shape.clone();
        shape[axis] = pieces.iter().map(|p| p.shape[axis]).sum();

        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for piece in pieces {
                let block = piece.shape[axis] * inner;
                data.extend_from_slice(&piece.data[o * block..(o + 1) * block]);
            }
        }
        Ok(Tensor { shape, data })
    }

    /// Applies an index expression. Axes without an item are taken whole.
    pub fn index(&self, items: &[IndexItem]) -> Result<Tensor, DataError> {
        if items.len() > self.ndim() {
            return Err(DataError::TooManyIndices {
                ndim: self.ndim(),
                given: items.len(),
            });
        }
        let full = IndexItem::full();
        let mut positions = Vec::with_capacity(self.ndim());
        let mut shape = Vec::new();
        for (axis, size) in self.shape.iter().enumerate() {
            let item = items.get(axis).unwrap_or(&full);
            let picked = item.positions(axis, *size)?;
            if !matches!(item, IndexItem::Int(_)) {
                shape.push(picked.len());
            }
            positions.push(picked);
        }
        Ok(self.gather(shape, &positions))
    }

    /// Rectangular sub-block starting at `offsets` with extents `extents`.
    pub fn block(&self, offsets: &[usize], extents: &[usize]) -> Tensor {
        let positions: Vec<Vec<usize>> = offsets
            .iter()
            .zip(extents)
            .map(|(o, e)| (*o..o + e).collect())
            .collect();
        self.gather(extents.to_vec(), &positions)
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.ndim()];
        for axis in (0..self.ndim().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.shape[axis + 1];
        }
        strides
    }

    fn gather(&self, shape: Vec<usize>, positions: &[Vec<usize>]) -> Tensor {
        let total: usize = positions.iter().map(|p| p.len()).product();
        let mut data = Vec::with_capacity(total);
        if total > 0 {
            let strides = self.strides();
            let mut cursor = vec![0usize; positions.len()];
            loop {
                let offset: usize = cursor
                    .iter()
                    .enumerate()
                    .map(|(axis, c)| positions[axis][*c] * strides[axis])
                    .sum();
                data.push(self.data[offset]);

                let mut axis = positions.len();
                loop {
                    if axis == 0 {
                        return Tensor { shape, data };
                    }
                    axis -= 1;
                    cursor[axis] += 1;
                    if cursor[axis] < positions[axis].len() {
                        break;
                    }
                    cursor[axis] = 0;
                }
            }
        }
        Tensor { shape, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: &[usize]) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::new(shape.to_vec(), (0..n).map(|v| v as f64).collect()).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_concatenate_axis_one() {
        let a = arange(&[2, 2]);
        let b = Tensor::full(&[2, 1], 9.0);
        let c = Tensor::concatenate(&[a, b], 1).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[0.0, 1.0, 9.0, 2.0, 3.0, 9.0]);
    }

    #[test]
    fn test_concatenate_mismatch() {
        let a = arange(&[2, 2]);
        let b = arange(&[3, 3]);
        assert!(Tensor::concatenate(&[a, b], 0).is_err());
    }

    #[test]
    fn test_index_slices_and_ints() {
        let t = arange(&[3, 4]);
        let row = t.index(&[IndexItem::Int(1)]).unwrap();
        assert_eq!(row.shape(), &[4]);
        assert_eq!(row.data(), &[4.0, 5.0, 6.0, 7.0]);

        let sub = t
            .index(&[IndexItem::range(1, 3), IndexItem::start_at(-2)])
            .unwrap();
        assert_eq!(sub.shape(), &[2, 2]);
        assert_eq!(sub.data(), &[6.0, 7.0, 10.0, 11.0]);

        let reversed = t
            .index(&[IndexItem::Slice {
                start: None,
                stop: None,
                step: Some(-1),
            }])
            .unwrap();
        assert_eq!(&reversed.data()[..4], &[8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_index_fancy() {
        let t = arange(&[4]);
        let picked = t.index(&[IndexItem::Array(vec![3, 0])]).unwrap();
        assert_eq!(picked.data(), &[3.0, 0.0]);
        let masked = t
            .index(&[IndexItem::Mask(vec![true, false, true, false])])
            .unwrap();
        assert_eq!(masked.data(), &[0.0, 2.0]);
        assert!(t.index(&[IndexItem::Int(4)]).is_err());
    }

    #[test]
    fn test_slice_with_huge_step() {
        let t = arange(&[3]);
        let picked = t
            .index(&[IndexItem::Slice {
                start: Some(1),
                stop: None,
                step: Some(i64::MAX),
            }])
            .unwrap();
        assert_eq!(picked.data(), &[1.0]);

        let back = t
            .index(&[IndexItem::Slice {
                start: None,
                stop: None,
                step: Some(i64::MIN),
            }])
            .unwrap();
        assert_eq!(back.data(), &[2.0]);
    }

    #[test]
    fn test_decode_checks_shape() {
        let good = crate::codec::serialize(&arange(&[2, 2])).unwrap();
        let decoded: Tensor = crate::codec::deserialize(&good).unwrap();
        assert_eq!(decoded, arange(&[2, 2]));

        #[derive(Serialize)]
        struct Forged {
            shape: Vec<usize>,
            data: Vec<f64>,
        }
        let bad = crate::codec::serialize(&Forged {
            shape: vec![10],
            data: vec![1.0],
        })
        .unwrap();
        assert!(matches!(
            crate::codec::deserialize::<Tensor>(&bad),
            Err(DataError::Codec(_))
        ));
        assert!(Tensor::new(vec![usize::MAX, 2], vec![]).is_err());
    }

    #[test]
    fn test_block() {
        let t = arange(&[4, 4]);
        let b = t.block(&[2, 1], &[2, 2]);
        assert_eq!(b.data(), &[9.0, 10.0, 13.0, 14.0]);
    }
}
