//
// transcode.rs
// Dicom-Sort-rs
//
// Decompression adapter: turns encapsulated pixel data into native pixels and retargets the transfer syntax.
//

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::DefaultDicomObject;
use dicom::pixeldata::PixelDecoder;
use dicom::transfer_syntax::entries::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use dicom_dictionary_std::tags;
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelRepresentation, VoiLutOption};
use tracing::debug;

use crate::dicom_access::ElementAccess;
use crate::error::StoreError;
use crate::store::AttributeStore;

/// Supported uncompressed transfer syntaxes for transcoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UncompressedTransferSyntax {
    ExplicitVRLittleEndian,
    ImplicitVRLittleEndian,
}

impl UncompressedTransferSyntax {
    pub fn uid(self) -> &'static str {
        match self {
            UncompressedTransferSyntax::ExplicitVRLittleEndian => EXPLICIT_VR_LITTLE_ENDIAN.uid(),
            UncompressedTransferSyntax::ImplicitVRLittleEndian => IMPLICIT_VR_LITTLE_ENDIAN.uid(),
        }
    }
}

struct NativePixels {
    bytes: Vec<u8>,
    vr: VR,
    samples_per_pixel: u16,
}

/// Decode the pixel data to raw native samples without applying any LUT, so pixel meaning is unchanged.
fn native_pixels(obj: &DefaultDicomObject) -> Result<NativePixels, StoreError> {
    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| StoreError::Decode(e.to_string()))?;

    let options = ConvertOptions::new()
        .with_modality_lut(ModalityLutOption::None)
        .with_voi_lut(VoiLutOption::Identity);
    let bits_allocated = decoded.bits_allocated();
    let samples_per_pixel = decoded.samples_per_pixel();

    let bytes = if bits_allocated > 8 {
        match decoded.pixel_representation() {
            PixelRepresentation::Signed => decoded
                .to_vec_with_options::<i16>(&options)
                .map(|words| words.into_iter().flat_map(i16::to_le_bytes).collect()),
            PixelRepresentation::Unsigned => decoded
                .to_vec_with_options::<u16>(&options)
                .map(|words| words.into_iter().flat_map(u16::to_le_bytes).collect()),
        }
    } else {
        decoded.to_vec_with_options::<u8>(&options)
    }
    .map_err(|e| StoreError::Decode(e.to_string()))?;

    Ok(NativePixels {
        bytes,
        vr: if bits_allocated > 8 { VR::OW } else { VR::OB },
        samples_per_pixel,
    })
}

/// Replace encapsulated pixel data with native samples and switch to Explicit VR Little Endian.
///
/// Returns `Ok(false)` when there was nothing to decompress. On error the store is left untouched.
pub fn decompress(store: &mut AttributeStore) -> Result<bool, StoreError> {
    if !store.is_compressed() {
        return Ok(false);
    }

    let native = native_pixels(store.object())?;
    let source_ts = store.transfer_syntax_uid();

    // Colour codecs hand back interleaved RGB regardless of the stored YBR variant.
    if native.samples_per_pixel == 3 {
        let photometric = store.text_or_unknown(tags::PHOTOMETRIC_INTERPRETATION);
        if photometric != "RGB" {
            store.put_str(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "RGB");
        }
        store.dataset_mut().put(DataElement::new(
            tags::PLANAR_CONFIGURATION,
            VR::US,
            PrimitiveValue::from(0_u16),
        ));
    }

    store.dataset_mut().put(DataElement::new(
        tags::PIXEL_DATA,
        native.vr,
        PrimitiveValue::from(native.bytes),
    ));
    store.set_transfer_syntax(UncompressedTransferSyntax::ExplicitVRLittleEndian.uid());
    debug!(from = %source_ts, "Decompressed pixel data");
    Ok(true)
}

/// Re-encode the object under an uncompressed transfer syntax, decompressing first when needed.
pub fn transcode(store: &mut AttributeStore, target: UncompressedTransferSyntax) -> Result<(), StoreError> {
    decompress(store)?;
    store.set_transfer_syntax(target.uid());
    Ok(())
}
