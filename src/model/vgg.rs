use crate::common::*;

pub trait FeatureExtractor: Send {
    fn extract(&self, image: &Tensor) -> Result<Vec<Tensor>>;
}

const VGG16_CONFIG: &[Option<i64>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
];

const VGG19_CONFIG: &[Option<i64>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// Exclusive ends of the five VGG19 stages, in torchvision layer indexes.
const VGG19_STAGE_ENDS: &[usize] = &[1, 6, 11, 20, 29];

/// Exclusive ends of relu1_2, relu2_2, relu3_3, relu4_3 and relu5_3 of VGG16.
const VGG16_TAP_ENDS: &[usize] = &[4, 9, 16, 23, 30];

#[derive(Debug)]
enum VggLayer {
    Conv(nn::Conv2D),
    Relu,
    MaxPool,
}

/// Variables are named `features.{index}` after the torchvision layer index,
/// so converted torchvision weights load directly.
#[derive(Debug)]
pub struct VggFeatures {
    layers: Vec<VggLayer>,
    stage_ends: Vec<usize>,
}

impl VggFeatures {
    pub fn vgg19<'a>(path: impl Borrow<nn::Path<'a>>) -> Self {
        Self::new(path.borrow(), VGG19_CONFIG, VGG19_STAGE_ENDS)
    }

    pub fn vgg16<'a>(path: impl Borrow<nn::Path<'a>>) -> Self {
        Self::new(path.borrow(), VGG16_CONFIG, VGG16_TAP_ENDS)
    }

    fn new(path: &nn::Path, config: &[Option<i64>], stage_ends: &[usize]) -> Self {
        let path = path / "features";
        let num_layers = stage_ends.last().copied().unwrap_or(0);
        let mut layers = vec![];
        let mut in_c = 3;

        for entry in config {
            if layers.len() >= num_layers {
                break;
            }

            match *entry {
                Some(out_c) => {
                    let conv = nn::conv2d(
                        &path / layers.len(),
                        in_c,
                        out_c,
                        3,
                        nn::ConvConfig {
                            padding: 1,
                            ..Default::default()
                        },
                    );
                    layers.push(VggLayer::Conv(conv));
                    layers.push(VggLayer::Relu);
                    in_c = out_c;
                }
                None => layers.push(VggLayer::MaxPool),
            }
        }
        layers.truncate(num_layers);

        Self {
            layers,
            stage_ends: stage_ends.to_vec(),
        }
    }

    pub fn num_stages(&self) -> usize {
        self.stage_ends.len()
    }

    pub fn stage_channels(&self) -> Vec<i64> {
        let mut channels = 0;
        let mut output = vec![];
        for (index, layer) in self.layers.iter().enumerate() {
            if let VggLayer::Conv(conv) = layer {
                channels = conv.ws.size()[0];
            }
            if self.stage_ends.contains(&(index + 1)) {
                output.push(channels);
            }
        }
        output
    }

    pub fn load(vgg19: bool, weights_file: Option<&Path>, device: Device) -> Result<FrozenVgg> {
        let mut vs = nn::VarStore::new(device);
        let features = if vgg19 {
            Self::vgg19(&vs.root())
        } else {
            Self::vgg16(&vs.root())
        };

        match weights_file {
            Some(file) => {
                vs.load(file).with_context(|| {
                    format!("unable to load VGG weights from '{}'", file.display())
                })?;
                info!("loaded VGG weights from '{}'", file.display());
            }
            None => warn!("no VGG weights file is given, using random weights"),
        }
        vs.freeze();

        Ok(FrozenVgg { _vs: vs, features })
    }
}

impl FeatureExtractor for VggFeatures {
    fn extract(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        let (_b, c, _h, _w) = image.size4()?;
        ensure!(c == 3, "expect 3 input channels, but get {}", c);

        let mut outputs = Vec::with_capacity(self.stage_ends.len());
        let mut xs = image.shallow_clone();

        for (index, layer) in self.layers.iter().enumerate() {
            xs = match layer {
                VggLayer::Conv(conv) => conv.forward(&xs),
                VggLayer::Relu => xs.relu(),
                VggLayer::MaxPool => xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false),
            };
            if self.stage_ends.contains(&(index + 1)) {
                outputs.push(xs.shallow_clone());
            }
        }

        Ok(outputs)
    }
}

#[derive(Debug)]
pub struct FrozenVgg {
    _vs: nn::VarStore,
    pub features: VggFeatures,
}

impl FeatureExtractor for FrozenVgg {
    fn extract(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        self.features.extract(image)
    }
}
