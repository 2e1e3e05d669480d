use std::marker::PhantomData;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::{Tensor, TensorData},
};

/// A single preprocessed sample.
///
/// Following Burn's convention, datasets return host data and the batcher
/// handles tensor creation and device placement.
#[derive(Debug, Clone)]
pub struct StrokeItem {
    pub id: String,
    /// Normalised image in `[3, H, W]` layout.
    pub image: Vec<f32>,
    /// Binary mask in `[H, W]` layout.
    pub mask: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

/// A batch of images `[N, 3, H, W]` and masks `[N, H, W]`.
#[derive(Debug, Clone)]
pub struct StrokeBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 3>,
    pub ids: Vec<String>,
}

impl<B: Backend> StrokeBatch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Stacks [`StrokeItem`]s into a [`StrokeBatch`].
///
/// All items of a batch must share the same spatial size, which holds for
/// anything produced by one [`Augmentor`](super::augmentation::Augmentor).
#[derive(Clone, Default)]
pub struct StrokeBatcher<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> StrokeBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, StrokeItem, StrokeBatch<B>> for StrokeBatcher<B> {
    fn batch(&self, items: Vec<StrokeItem>, device: &B::Device) -> StrokeBatch<B> {
        let batch_size = items.len();
        let (height, width) = items
            .first()
            .map_or((0, 0), |item| (item.height, item.width));

        let mut images = Vec::with_capacity(batch_size * 3 * height * width);
        let mut masks = Vec::with_capacity(batch_size * height * width);
        let mut ids = Vec::with_capacity(batch_size);

        for item in items {
            debug_assert_eq!((item.height, item.width), (height, width));
            images.extend_from_slice(&item.image);
            masks.extend_from_slice(&item.mask);
            ids.push(item.id);
        }

        StrokeBatch {
            images: Tensor::from_data(
                TensorData::new(images, [batch_size, 3, height, width]),
                device,
            ),
            masks: Tensor::from_data(TensorData::new(masks, [batch_size, height, width]), device),
            ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn item(id: &str, value: f32, height: usize, width: usize) -> StrokeItem {
        StrokeItem {
            id: id.to_string(),
            image: vec![value; 3 * height * width],
            mask: vec![1.0; height * width],
            height,
            width,
        }
    }

    #[test]
    fn stroke_batcher_creates_correct_batch_dimensions() {
        let device = Default::default();
        let batcher = StrokeBatcher::<TestBackend>::new();

        let batch = batcher.batch(vec![item("a", 0.5, 32, 16), item("b", -0.5, 32, 16)], &device);

        assert_eq!(batch.images.dims(), [2, 3, 32, 16]);
        assert_eq!(batch.masks.dims(), [2, 32, 16]);
        assert_eq!(batch.ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(batch.len(), 2);

        let second: f32 = batch
            .images
            .slice([1..2, 0..1, 0..1, 0..1])
            .into_scalar();
        assert_eq!(second, -0.5);
    }
}
