//! CPG individual types.
//!
//! An [`Individual`] is a tagged record: metadata, typed evolvable genes and a
//! reference to the constants block shared by everything one factory produces.
//! [`IndividualRecord`] is its on-disk form, with matrices as nested lists.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Names of the evolvable fields in canonical draw order.
pub const GENE_FIELDS: [&str; 10] = [
    "w", "phi", "a", "gsl", "gsh", "gb1", "gb2", "theta", "ampl", "ampl_dot",
];

/// Role of an oscillator in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OscillatorClass {
    Body = 0,
    Limb = 1,
}

impl OscillatorClass {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OscillatorClass::Body),
            1 => Some(OscillatorClass::Limb),
            _ => None,
        }
    }
}

/// Non-evolved model constants. Each pair is `[body, limb]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constants {
    /// Frequency offset per class.
    pub cv0: [f64; 2],
    /// Frequency slope per class.
    pub cv1: [f64; 2],
    /// Amplitude offset per class.
    #[serde(rename = "cR0")]
    pub cr0: [f64; 2],
    /// Amplitude slope per class.
    #[serde(rename = "cR1")]
    pub cr1: [f64; 2],
    /// Drive saturation range `[[body_low, body_high], [limb_low, limb_high]]`.
    pub d_params: [[u32; 2]; 2],
    /// Class tag per oscillator: 0 = body, 1 = limb.
    pub osc_class: Vec<u8>,
}

impl Constants {
    /// Standard constants for `n` oscillators, the first `body` of which are body oscillators.
    pub fn new(n: usize, body: usize) -> Self {
        Self {
            cv0: [0.3, 0.0],
            cv1: [0.2, 0.2],
            cr0: [0.196, 0.131],
            cr1: [0.065, 0.131],
            d_params: [[1, 5], [1, 3]],
            osc_class: (0..n)
                .map(|i| {
                    if i < body {
                        OscillatorClass::Body as u8
                    } else {
                        OscillatorClass::Limb as u8
                    }
                })
                .collect(),
        }
    }

    /// Class of oscillator `i`, if the tag is known.
    pub fn class_of(&self, i: usize) -> Option<OscillatorClass> {
        self.osc_class.get(i).copied().and_then(OscillatorClass::from_u8)
    }
}

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from nested rows. Returns `None` for ragged input.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != n_cols) {
            return None;
        }
        Some(Self {
            rows: n_rows,
            cols: n_cols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Nested-row copy for serialization.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks(self.cols).map(<[f64]>::to_vec).collect()
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Evolvable parameters of one CPG.
#[derive(Debug, Clone, PartialEq)]
pub struct Genes {
    /// Coupling weights (n×n).
    pub w: Matrix,
    /// Phase biases (n×n).
    pub phi: Matrix,
    /// Amplitude convergence rates (n).
    pub a: Vec<f64>,
    /// Sub-linear slope.
    pub gsl: f64,
    /// Supra-linear slope.
    pub gsh: f64,
    /// Swing bound 1.
    pub gb1: f64,
    /// Swing bound 2.
    pub gb2: f64,
    /// Initial phases (n).
    pub theta: Vec<f64>,
    /// Initial amplitudes (n).
    pub ampl: Vec<f64>,
    /// Initial amplitude rates (n).
    pub ampl_dot: Vec<f64>,
}

impl Genes {
    /// Zero-filled genes for `n` oscillators.
    pub fn zeros(n: usize) -> Self {
        Self {
            w: Matrix::zeros(n, n),
            phi: Matrix::zeros(n, n),
            a: vec![0.0; n],
            gsl: 0.0,
            gsh: 0.0,
            gb1: 0.0,
            gb2: 0.0,
            theta: vec![0.0; n],
            ampl: vec![0.0; n],
            ampl_dot: vec![0.0; n],
        }
    }

    /// Every field as a flat slice, in [`GENE_FIELDS`] order. Scalars are one-element slices.
    pub fn fields(&self) -> [&[f64]; 10] {
        [
            self.w.as_slice(),
            self.phi.as_slice(),
            &self.a,
            std::slice::from_ref(&self.gsl),
            std::slice::from_ref(&self.gsh),
            std::slice::from_ref(&self.gb1),
            std::slice::from_ref(&self.gb2),
            &self.theta,
            &self.ampl,
            &self.ampl_dot,
        ]
    }

    /// Mutable counterpart of [`Genes::fields`].
    pub fn fields_mut(&mut self) -> [&mut [f64]; 10] {
        [
            self.w.as_mut_slice(),
            self.phi.as_mut_slice(),
            &mut self.a,
            std::slice::from_mut(&mut self.gsl),
            std::slice::from_mut(&mut self.gsh),
            std::slice::from_mut(&mut self.gb1),
            std::slice::from_mut(&mut self.gb2),
            &mut self.theta,
            &mut self.ampl,
            &mut self.ampl_dot,
        ]
    }

    /// Whether every field has the same shape as in `other`.
    pub fn same_shape(&self, other: &Genes) -> bool {
        self.w.shape() == other.w.shape()
            && self.phi.shape() == other.phi.shape()
            && self
                .fields()
                .iter()
                .zip(other.fields().iter())
                .all(|(a, b)| a.len() == b.len())
    }

    /// Total number of evolvable values.
    pub fn gene_count(&self) -> usize {
        self.fields().iter().map(|f| f.len()).sum()
    }
}

/// Identity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndividualMeta {
    /// Generation-local identity.
    pub ident: String,
    /// Oscillator count.
    pub n: usize,
}

/// One candidate CPG parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct Individual {
    pub meta: IndividualMeta,
    pub genes: Genes,
    pub constants: Arc<Constants>,
}

impl Individual {
    #[inline]
    pub fn ident(&self) -> &str {
        &self.meta.ident
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.meta.n
    }

    /// Whether both individuals reference the same constants block.
    pub fn shares_constants(&self, other: &Individual) -> bool {
        Arc::ptr_eq(&self.constants, &other.constants)
    }

    /// Convert to the on-disk record.
    pub fn to_record(&self) -> IndividualRecord {
        let g = &self.genes;
        IndividualRecord {
            ident: self.meta.ident.clone(),
            n: self.meta.n,
            constants: (*self.constants).clone(),
            w: g.w.to_rows(),
            phi: g.phi.to_rows(),
            a: g.a.clone(),
            gsl: g.gsl,
            gsh: g.gsh,
            gb1: g.gb1,
            gb2: g.gb2,
            theta: g.theta.clone(),
            ampl: g.ampl.clone(),
            ampl_dot: g.ampl_dot.clone(),
        }
    }
}

/// Serialized form of an [`Individual`] (`<ident>.enc`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualRecord {
    pub ident: String,
    pub n: usize,
    #[serde(flatten)]
    pub constants: Constants,
    pub w: Vec<Vec<f64>>,
    pub phi: Vec<Vec<f64>>,
    pub a: Vec<f64>,
    pub gsl: f64,
    pub gsh: f64,
    pub gb1: f64,
    pub gb2: f64,
    pub theta: Vec<f64>,
    pub ampl: Vec<f64>,
    pub ampl_dot: Vec<f64>,
}
