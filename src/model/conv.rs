use crate::common::*;

#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub bias: bool,
    pub transposed: bool,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Conv2DInit {
    pub fn new(ksize: usize) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            dilation: 1,
            bias: true,
            transposed: false,
            ws_init: nn::Init::KaimingUniform,
            bs_init: nn::Init::Const(0.0),
        }
    }

    pub fn dilated(ksize: usize, dilation: usize) -> Self {
        Self {
            dilation,
            padding: ksize / 2 * dilation,
            ..Self::new(ksize)
        }
    }

    pub fn upsample() -> Self {
        Self {
            stride: 2,
            padding: 1,
            transposed: true,
            ..Self::new(4)
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Conv2D> {
        let Self {
            ksize,
            stride,
            padding,
            dilation,
            bias,
            transposed,
            ws_init,
            bs_init,
        } = self;

        ensure!(ksize > 0 && stride > 0 && dilation > 0, "invalid convolution parameters");
        ensure!(in_dim > 0 && out_dim > 0, "zero channels is not allowed");

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;

        let bs = bias.then(|| path.var("bias", &[out_dim], bs_init));
        let ws = {
            let weight_size = if transposed {
                [in_dim, out_dim, ksize, ksize]
            } else {
                [out_dim, in_dim, ksize, ksize]
            };
            path.var("weight", &weight_size, ws_init)
        };

        Ok(Conv2D {
            stride: vec![stride as i64; 2],
            padding: vec![padding as i64; 2],
            dilation: vec![dilation as i64; 2],
            output_padding: vec![0; 2],
            transposed,
            weight: ws,
            bias: bs,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    stride: Vec<i64>,
    padding: Vec<i64>,
    dilation: Vec<i64>,
    output_padding: Vec<i64>,
    transposed: bool,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl nn::Module for Conv2D {
    fn forward(&self, input: &Tensor) -> Tensor {
        let Self {
            ref stride,
            ref padding,
            ref dilation,
            ref output_padding,
            transposed,
            ref weight,
            ref bias,
        } = *self;

        input.convolution(
            weight,
            bias.as_ref(),
            stride,
            padding,
            dilation,
            transposed,
            output_padding,
            1,
        )
    }
}

/// Gated convolution: `elu(feature(x)) * sigmoid(gate(x))`.
#[derive(Debug, Clone)]
pub struct GatedConv2DInit {
    pub conv: Conv2DInit,
    pub activation: bool,
}

impl GatedConv2DInit {
    pub fn new(ksize: usize) -> Self {
        Self {
            conv: Conv2DInit::new(ksize),
            activation: true,
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<GatedConv2D> {
        let path = path.borrow();
        let Self { conv, activation } = self;

        let feature = conv.clone().build(path / "feature", in_dim, out_dim)?;
        let gate = conv.build(path / "gate", in_dim, out_dim)?;

        Ok(GatedConv2D {
            feature,
            gate,
            activation,
        })
    }
}

#[derive(Debug)]
pub struct GatedConv2D {
    feature: Conv2D,
    gate: Conv2D,
    activation: bool,
}

impl nn::Module for GatedConv2D {
    fn forward(&self, input: &Tensor) -> Tensor {
        let Self {
            ref feature,
            ref gate,
            activation,
        } = *self;

        let xs = feature.forward(input);
        let xs = if activation { xs.elu() } else { xs };
        xs * gate.forward(input).sigmoid()
    }
}
