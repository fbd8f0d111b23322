use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use face_preference_lib::ml::dataset::{
    build_training_set, build_training_set_with_summary, NEGATIVE_LABEL, POSITIVE_LABEL,
};
use face_preference_lib::DatasetError;

fn write_image(dir: &Path, name: &str, format: ImageFormat, colour: [u8; 3]) {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb(colour)));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, format).unwrap();
    fs::write(dir.join(name), buffer.into_inner()).unwrap();
}

#[test]
fn test_three_positives_without_negative_dir() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "a.png", ImageFormat::Png, [255, 0, 0]);
    write_image(dir.path(), "b.jpg", ImageFormat::Jpeg, [0, 255, 0]);
    write_image(dir.path(), "c.JPEG", ImageFormat::Jpeg, [0, 0, 255]);

    let set = build_training_set(dir.path(), None).unwrap();

    assert_eq!(set.len(), 3);
    assert_eq!(set.images().dims(), [3, 224, 224, 3]);
    assert_eq!(set.labels().as_slice(), &[1, 1, 1]);
}

#[test]
fn test_corrupt_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "ok1.png", ImageFormat::Png, [10, 20, 30]);
    write_image(dir.path(), "ok2.png", ImageFormat::Png, [40, 50, 60]);
    fs::write(dir.path().join("broken.jpg"), b"\xFF\xD8 truncated jpeg").unwrap();

    let (set, summary) = build_training_set_with_summary(dir.path(), None).unwrap();

    assert_eq!(set.len(), 2);
    assert_eq!(set.labels().len(), 2);
    assert_eq!(summary.positive, 2);
    assert_eq!(summary.skipped, 1);
}

#[test]
fn test_empty_positive_dir_is_no_training_data() {
    let dir = tempfile::tempdir().unwrap();
    let err = build_training_set(dir.path(), None).unwrap_err();
    assert!(matches!(err, DatasetError::NoTrainingData { .. }));
}

#[test]
fn test_negatives_are_labelled_zero() {
    let positive = tempfile::tempdir().unwrap();
    let negative = tempfile::tempdir().unwrap();
    write_image(positive.path(), "p1.png", ImageFormat::Png, [250, 250, 250]);
    write_image(positive.path(), "p2.png", ImageFormat::Png, [240, 240, 240]);
    write_image(negative.path(), "n1.png", ImageFormat::Png, [5, 5, 5]);

    let (set, summary) =
        build_training_set_with_summary(positive.path(), Some(negative.path())).unwrap();

    assert_eq!(set.len(), 3);
    assert_eq!(set.labels().count(POSITIVE_LABEL), 2);
    assert_eq!(set.labels().count(NEGATIVE_LABEL), 1);
    assert_eq!((summary.positive, summary.negative), (2, 1));

    // シャッフル後も画像とラベルの対応が保たれる
    for i in 0..set.len() {
        let first = set.images().sample(i).unwrap()[0];
        let label = set.labels().as_slice()[i];
        assert_eq!(label == POSITIVE_LABEL, first > 0.5);
    }
}

#[test]
fn test_missing_negative_dir_is_ignored() {
    let positive = tempfile::tempdir().unwrap();
    write_image(positive.path(), "p.png", ImageFormat::Png, [1, 2, 3]);
    let missing = positive.path().join("does-not-exist");

    let set = build_training_set(positive.path(), Some(missing.as_path())).unwrap();
    assert_eq!(set.labels().as_slice(), &[1]);
}

#[test]
fn test_non_image_files_are_not_listed() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "a.png", ImageFormat::Png, [1, 2, 3]);
    fs::write(dir.path().join("b.gif"), b"GIF89a").unwrap();
    fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    fs::create_dir(dir.path().join("sub.png")).unwrap();

    let (set, summary) = build_training_set_with_summary(dir.path(), None).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(summary.skipped, 0);
}
